use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Upstream identifier. The API mixes numeric and string ids, so everything is kept in its
/// string form and compared as such.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Id(String);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for Id {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        id_from_value(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {v}")))
    }
}

fn id_from_value(v: &Value) -> Option<Id> {
    match v {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| Id(t.to_string()))
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(Id(i.to_string()));
            }
            if let Some(u) = n.as_u64() {
                return Some(Id(u.to_string()));
            }
            let f = n.as_f64()?;
            if f.is_finite() && f.fract() == 0.0 {
                Some(Id(format!("{f:.0}")))
            } else {
                Some(Id(f.to_string()))
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Id,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Id,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRef {
    pub id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<Id>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub contact_id: Option<Id>,
    #[serde(default, deserialize_with = "lenient_stage")]
    pub stage: Option<StageRef>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub stage_id: Option<Id>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub value: f64,
    /// Naive `YYYY-MM-DD HH:mm:ss`, always read as UTC.
    #[serde(default, deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
}

impl Opportunity {
    /// Stage id from either the nested `stage.id` or the flat `stage_id`.
    pub fn stage_key(&self) -> Option<&Id> {
        self.stage
            .as_ref()
            .and_then(|s| s.id.as_ref())
            .or(self.stage_id.as_ref())
    }
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Id>, D::Error> {
    let v = Value::deserialize(deserializer)?;
    Ok(id_from_value(&v))
}

fn lenient_stage<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<StageRef>, D::Error> {
    let v = Value::deserialize(deserializer)?;
    Ok(match &v {
        Value::Object(map) => Some(StageRef {
            id: map.get("id").and_then(id_from_value),
        }),
        _ => None,
    })
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let v = Value::deserialize(deserializer)?;
    let n = match &v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    Ok(if n.is_finite() { n } else { 0.0 })
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let v = Value::deserialize(deserializer)?;
    Ok(match v {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

fn string_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}
