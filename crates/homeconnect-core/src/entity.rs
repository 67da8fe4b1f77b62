// ── Runtime entity ──
//
// One live appliance feature. The profile description stays immutable;
// the fields a description-change notification may move (access,
// availability, bounds) are copied into per-session state, alongside the
// two value slots:
//
//   value  -- last value written by us or received from the appliance
//   shadow -- last value the appliance acknowledged
//
// The split matters: a write that fails on the wire must not pollute the
// acknowledged state, because program start fills unset options from
// shadow values.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::trace;

use homeconnect_api::{Action, Message, Transport};

use crate::describe::{Access, EntityDescription, EntityKind};
use crate::error::{CoreError, Result};
use crate::value::coerce;

#[derive(Debug, Clone, Default)]
struct EntityState {
    value: Option<Value>,
    shadow: Option<Value>,
    access: Option<Access>,
    available: Option<bool>,
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
}

/// One appliance feature bound to a transport.
pub struct Entity {
    kind: EntityKind,
    desc: EntityDescription,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    state: RwLock<EntityState>,
}

impl Entity {
    pub(crate) fn new(
        kind: EntityKind,
        desc: EntityDescription,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let state = EntityState {
            access: desc.access,
            available: desc.available,
            min: desc.min,
            max: desc.max,
            step: desc.step,
            ..EntityState::default()
        };
        Arc::new(Self {
            kind,
            desc,
            transport,
            request_timeout,
            state: RwLock::new(state),
        })
    }

    pub fn uid(&self) -> u32 {
        self.desc.uid
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The immutable profile description.
    pub fn description(&self) -> &EntityDescription {
        &self.desc
    }

    pub fn access(&self) -> Option<Access> {
        self.state.read().access
    }

    pub fn available(&self) -> Option<bool> {
        self.state.read().available
    }

    pub fn min(&self) -> Option<f64> {
        self.state.read().min
    }

    pub fn max(&self) -> Option<f64> {
        self.state.read().max
    }

    pub fn step(&self) -> Option<f64> {
        self.state.read().step
    }

    /// Last value written or received, as it travels on the wire.
    pub fn value_raw(&self) -> Option<Value> {
        self.state.read().value.clone()
    }

    /// Last value the appliance acknowledged.
    pub fn shadow_raw(&self) -> Option<Value> {
        self.state.read().shadow.clone()
    }

    /// Current value for display: enum codes map to their labels,
    /// everything else comes back raw.
    pub fn value(&self) -> Option<Value> {
        let raw = self.value_raw()?;
        Some(self.display(&raw))
    }

    fn display(&self, raw: &Value) -> Value {
        raw.as_i64()
            .and_then(|code| self.desc.enum_label(code))
            .map(|label| Value::String(label.to_string()))
            .unwrap_or_else(|| raw.clone())
    }

    /// Write a value to the appliance via POST `/ro/values`.
    ///
    /// The value is coerced to the entity's protocol type first (enum
    /// labels become their wire codes). Rejected locally when the entity
    /// is not writable or the appliance reports it unavailable. The
    /// shadow value advances only once the appliance acknowledges.
    pub async fn write(&self, value: Value) -> Result<()> {
        {
            let st = self.state.read();
            if !st.access.is_some_and(Access::writable) {
                return Err(CoreError::NotWritable {
                    name: self.desc.name.clone(),
                });
            }
            if st.available == Some(false) {
                return Err(CoreError::Unavailable {
                    name: self.desc.name.clone(),
                });
            }
        }

        let wire_value = self.to_wire_value(&value);
        self.state.write().value = Some(wire_value.clone());

        let message = Message {
            resource: "/ro/values".into(),
            action: Action::Post,
            data: vec![json!({ "uid": self.desc.uid, "value": wire_value })],
            ..Message::default()
        };
        self.transport
            .send_sync(message, self.request_timeout)
            .await?;

        self.state.write().shadow = Some(wire_value);
        Ok(())
    }

    fn to_wire_value(&self, value: &Value) -> Value {
        // Enum labels travel as their integer codes.
        if let Value::String(label) = value {
            if let Some(code) = self.desc.enum_code(label) {
                return Value::from(code);
            }
        }
        coerce(self.desc.protocol_type, value)
    }

    /// Absorb one update object from a `/ro/values` or
    /// `/ro/descriptionChange` notification (or a read response).
    ///
    /// A present `value` is coerced and stored as both raw and shadow;
    /// `access`, `available`, `min`, `max`, `stepSize` are absorbed when
    /// present.
    pub fn apply_update(&self, update: &Value) {
        let mut st = self.state.write();

        if let Some(value) = update.get("value") {
            let coerced = coerce(self.desc.protocol_type, value);
            st.value = Some(coerced.clone());
            st.shadow = Some(coerced);
        }
        if let Some(access) = update.get("access").and_then(Value::as_str) {
            st.access = Access::from_wire(access);
        }
        if let Some(available) = update.get("available").and_then(Value::as_bool) {
            st.available = Some(available);
        }
        if let Some(min) = update.get("min").and_then(Value::as_f64) {
            st.min = Some(min);
        }
        if let Some(max) = update.get("max").and_then(Value::as_f64) {
            st.max = Some(max);
        }
        if let Some(step) = update.get("stepSize").and_then(Value::as_f64) {
            st.step = Some(step);
        }
        trace!(uid = self.desc.uid, name = %self.desc.name, "entity updated");
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("uid", &self.desc.uid)
            .field("name", &self.desc.name)
            .field("kind", &self.kind)
            .field("value", &self.value_raw())
            .finish()
    }
}
