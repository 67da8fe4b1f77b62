// ── Message envelope codec ──
//
// One JSON object per frame. Parsing is deliberately lenient: appliances
// disagree on numeric encodings (integers arrive as floats or strings on
// some firmware), unknown fields appear freely, and `data` is sometimes
// a bare object instead of an array. A strict serde derive would reject
// real traffic, so the envelope is decoded by hand from `serde_json::Value`.

use serde_json::{Map, Value};

use crate::error::Error;

/// Envelope action verb. Unknown wire actions fall back to `Get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Get,
    Post,
    Response,
    Notify,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Get => "GET",
            Action::Post => "POST",
            Action::Response => "RESPONSE",
            Action::Notify => "NOTIFY",
        }
    }

    fn from_wire(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Action::Post,
            "RESPONSE" => Action::Response,
            "NOTIFY" => Action::Notify,
            _ => Action::Get,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The message envelope every frame carries.
///
/// `sid` and `msg_id` serialise as `sID` / `msgID`. An empty `data`
/// sequence is omitted on the wire; presence of `code` on a RESPONSE
/// signals failure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub resource: String,
    pub action: Action,
    pub sid: Option<i64>,
    pub msg_id: Option<i64>,
    pub version: Option<i32>,
    pub data: Vec<Value>,
    pub code: Option<i32>,
}

impl Message {
    /// A GET request for `resource` with no payload.
    pub fn get(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Self::default()
        }
    }

    /// A POST request for `resource` carrying `data`.
    pub fn post(resource: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            resource: resource.into(),
            action: Action::Post,
            data,
            ..Self::default()
        }
    }

    /// A NOTIFY for `resource` (fire-and-forget, no correlation).
    pub fn notify(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: Action::Notify,
            ..Self::default()
        }
    }

    /// The service this message addresses: the two characters after the
    /// leading `/` (`"/ci/services"` -> `"ci"`).
    pub fn service(&self) -> Option<&str> {
        self.resource.strip_prefix('/')?.get(..2)
    }

    /// First element of `data`, when present.
    pub fn first_data(&self) -> Option<&Value> {
        self.data.first()
    }

    /// Parse one frame. Unknown fields are ignored; numeric envelope
    /// fields accept integers, zero-fraction floats, and numeric strings
    /// (anything else counts as absent); a non-array `data` is wrapped
    /// into a single-element sequence.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid JSON envelope: {e}")))?;
        let obj = root
            .as_object()
            .ok_or_else(|| Error::Protocol("envelope is not an object".into()))?;

        let resource = obj
            .get("resource")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("envelope has no resource".into()))?
            .to_string();

        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .map(Action::from_wire)
            .unwrap_or_default();

        let data = match obj.get("data") {
            None => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        };

        Ok(Self {
            resource,
            action,
            sid: obj.get("sID").and_then(lenient_i64),
            msg_id: obj.get("msgID").and_then(lenient_i64),
            version: obj.get("version").and_then(lenient_i32),
            data,
            code: obj.get("code").and_then(lenient_i32),
        })
    }

    /// Serialise for the wire. Optional numeric fields are omitted when
    /// absent, `data` when empty, and the action always emits upper-case.
    pub fn to_wire(&self) -> String {
        let mut obj = Map::new();
        if let Some(sid) = self.sid {
            obj.insert("sID".into(), sid.into());
        }
        if let Some(msg_id) = self.msg_id {
            obj.insert("msgID".into(), msg_id.into());
        }
        obj.insert("resource".into(), self.resource.clone().into());
        if let Some(version) = self.version {
            obj.insert("version".into(), version.into());
        }
        obj.insert("action".into(), self.action.as_str().into());
        if let Some(code) = self.code {
            obj.insert("code".into(), code.into());
        }
        if !self.data.is_empty() {
            obj.insert("data".into(), Value::Array(self.data.clone()));
        }
        Value::Object(obj).to_string()
    }
}

/// Lenient signed-64 read: integer, float whose fractional part is zero,
/// or numeric string. Booleans and everything else count as absent.
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| f as i64)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn lenient_i32(value: &Value) -> Option<i32> {
    lenient_i64(value).map(|v| v as i32)
}
