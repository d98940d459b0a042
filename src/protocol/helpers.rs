//! Serde deserialization functions which normalize differently shaped data.

use serde::{Deserialize, Deserializer};

/// Deserialize a JSON single value, array or null into a Vec.
///
/// Remote platforms send `to` and `cc` as a bare string, an array, or leave
/// the field out entirely; all shapes collapse to a vector here.
pub fn deserialize_one_or_many<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    let result: Option<OneOrMany<T>> = Deserialize::deserialize(deserializer)?;
    Ok(match result {
        Some(OneOrMany::Many(list)) => list,
        Some(OneOrMany::One(value)) => vec![value],
        None => Vec::new(),
    })
}
