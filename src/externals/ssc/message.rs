use serde::{Deserialize, Serialize};

use crate::internals::core::ports::LinkError;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
struct LevelMessage {
    audio: Audio,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
struct Audio {
    out: Out,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
struct Out {
    level: Option<f64>,
}

impl LevelMessage {
    fn new(level: Option<f64>) -> Self {
        Self {
            audio: Audio { out: Out { level } },
        }
    }
}

/// `{"audio":{"out":{"level":null}}}`
pub fn level_query() -> Result<String, LinkError> {
    encode(&LevelMessage::new(None))
}

pub fn level_command(level: f64) -> Result<String, LinkError> {
    if !level.is_finite() {
        return Err(LinkError::Malformed(format!("Refusing to send level {}.", level)));
    }
    encode(&LevelMessage::new(Some(level)))
}

/// Parse a level response. Anything other than exactly the level schema with
/// a number in it is malformed.
pub fn parse_level(raw: &str) -> Result<f64, LinkError> {
    let message = serde_json::from_str::<LevelMessage>(raw)
        .map_err(|e| LinkError::Malformed(format!("{} in `{}`", e, raw)))?;
    message
        .audio
        .out
        .level
        .ok_or_else(|| LinkError::Malformed(format!("No level in `{}`", raw)))
}

fn encode(message: &LevelMessage) -> Result<String, LinkError> {
    serde_json::to_string(message).map_err(|e| LinkError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_and_command_wire_format() {
        assert_eq!(level_query().unwrap(), r#"{"audio":{"out":{"level":null}}}"#);
        assert_eq!(
            level_command(42.5).unwrap(),
            r#"{"audio":{"out":{"level":42.5}}}"#
        );
        assert!(level_command(f64::INFINITY).is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(r#"{"audio":{"out":{"level":61.5}}}"#).unwrap(), 61.5);
        assert_eq!(
            parse_level(r#"{ "audio": { "out": { "level": 70 } } }"#).unwrap(),
            70f64
        );
    }

    #[test]
    fn test_parse_level_rejects_other_shapes() {
        for raw in [
            r#"{"audio":{"out":{"level":null}}}"#,
            r#"{"audio":{"out":{"level":"loud"}}}"#,
            r#"{"audio":{"out":{"level":50,"mute":false}}}"#,
            r#"{"osc":{"error":[{"audio":[404,{"desc":"address not found"}]}]}}"#,
            "",
            "not json",
        ] {
            assert!(
                matches!(parse_level(raw), Err(LinkError::Malformed(_))),
                "accepted `{}`",
                raw
            );
        }
    }
}
