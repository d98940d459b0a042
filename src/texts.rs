//! Embedded message snippets: toot bodies, birb replies, account bios.
//!
//! Snippets live under `src/snippets/` and are compiled into the binary.
//! Placeholders have the shape `{{name}}`; values substituted into `.html`
//! snippets are HTML-escaped first.

/// Access to the embedded snippets.
#[derive(Clone, Copy, Debug, Default)]
pub struct Texts;

const SNIPPETS: &[(&str, &str)] = &[
    ("toot_new_post.html", include_str!("snippets/toot_new_post.html")),
    ("reply_got_feed.html", include_str!("snippets/reply_got_feed.html")),
    (
        "reply_no_single_url.html",
        include_str!("snippets/reply_no_single_url.html"),
    ),
    (
        "reply_site_not_found.html",
        include_str!("snippets/reply_site_not_found.html"),
    ),
    (
        "reply_feed_mastodon.html",
        include_str!("snippets/reply_feed_mastodon.html"),
    ),
    ("reply_feed_banned.html", include_str!("snippets/reply_feed_banned.html")),
    ("reply_feed_optout.html", include_str!("snippets/reply_feed_optout.html")),
    ("acct_bio.html", include_str!("snippets/acct_bio.html")),
    ("birb_name.txt", include_str!("snippets/birb_name.txt")),
    ("birb_bio.html", include_str!("snippets/birb_bio.html")),
];

impl Texts {
    /// Returns the raw snippet, or an empty string for an unknown id.
    pub fn get(&self, id: &str) -> String {
        SNIPPETS
            .iter()
            .find(|(name, _)| *name == id)
            .map(|(_, body)| (*body).trim_end().to_owned())
            .unwrap_or_default()
    }

    /// Returns the snippet with placeholders filled in.
    pub fn with_vals(&self, id: &str, vals: &[(&str, &str)]) -> String {
        let mut res = self.get(id);
        let is_html = id.ends_with(".html");
        for (name, val) in vals {
            let pattern = format!("{{{{{}}}}}", name);
            let val = if is_html {
                escape_html(val)
            } else {
                (*val).to_owned()
            };
            res = res.replace(&pattern, &val);
        }
        res
    }
}

/// Strips all markup and decodes entities; what is left is plain text.
pub fn strip_html(html: &str) -> String {
    let fragment = scraper::Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .collect::<String>()
        .trim()
        .to_owned()
}

/// Minimal HTML escaping for text substituted into markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_placeholders_with_escaping() {
        let txt = Texts;
        let res = txt.with_vals(
            "toot_new_post.html",
            &[
                ("title", "Tom & Jerry <3"),
                ("url", "https://example.com/post"),
                ("prettyUrl", "example.com/post"),
                ("description", "a post"),
            ],
        );
        assert!(res.contains("Tom &amp; Jerry &lt;3"));
        assert!(res.contains("href=\"https://example.com/post\""));
        assert!(!res.contains("{{"));
    }

    #[test]
    fn strips_markup_and_entities() {
        assert_eq!(strip_html("<p>Tom &amp; Jerry</p>"), "Tom & Jerry");
        assert_eq!(strip_html("plain"), "plain");
        assert_eq!(strip_html("  <b>bold</b> claim "), "bold claim");
    }

    #[test]
    fn unknown_snippet_is_empty() {
        assert_eq!(Texts.get("no_such_snippet.html"), "");
    }

    #[test]
    fn all_reply_snippets_mention_the_caller() {
        for id in [
            "reply_no_single_url.html",
            "reply_site_not_found.html",
            "reply_feed_mastodon.html",
            "reply_feed_banned.html",
            "reply_feed_optout.html",
        ] {
            let res = Texts.with_vals(
                id,
                &[("moniker", "@pixie@stardust.community"), ("userUrl", "https://x.y/u/p")],
            );
            assert!(res.contains("@pixie@stardust.community"), "snippet {}", id);
        }
    }
}
