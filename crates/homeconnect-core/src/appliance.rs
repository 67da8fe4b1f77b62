// ── Profile-to-runtime wiring ──
//
// Builds the live entity registry from a parsed DeviceDescription and
// hands every inbound NOTIFY back into entity state. Also computes the
// role an integration layer would give each entity (switch, sensor, ...)
// and the keepalive probe uid the session should use.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use homeconnect_api::{lenient_i64, Message, Session, Transport};

use crate::describe::{
    Access, DeviceDescription, DeviceInfo, EntityDescription, EntityKind, ProtocolType,
};
use crate::entity::Entity;
use crate::error::{CoreError, Result};
use crate::program::Program;

const ON_LABELS: [&str; 3] = ["on", "standby", "true"];
const OFF_LABELS: [&str; 3] = ["off", "mainsoff", "false"];

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// One applied entity update, broadcast to subscribers. `value` is the
/// display value (enum labels resolved), as of just after the update.
#[derive(Debug, Clone)]
pub struct EntityUpdate {
    pub uid: u32,
    pub name: String,
    pub value: Option<Value>,
}

/// How an integration layer should surface an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRole {
    /// Boolean-like setting (on/off).
    Switch,
    /// Bounded numeric setting.
    Number,
    /// Enumerated setting with more than two values.
    Select,
    /// Read-only value.
    Sensor,
    /// Read-only boolean-like value.
    BinarySensor,
    /// Single-shot trigger; activating it writes `true`.
    Command,
    /// Appliance-raised event.
    Event,
    /// Program option.
    Option,
    /// Program (or the active/selected program slot).
    Program,
}

/// The live runtime for one appliance.
#[derive(Clone)]
pub struct Appliance {
    inner: Arc<ApplianceInner>,
}

struct ApplianceInner {
    info: DeviceInfo,
    entities_by_uid: HashMap<u32, Arc<Entity>>,
    uid_by_name: HashMap<String, u32>,
    programs: HashMap<u32, Program>,
    active_program: Option<Arc<Entity>>,
    selected_program: Option<Arc<Entity>>,
    keepalive_uid: Option<u32>,
    update_tx: broadcast::Sender<EntityUpdate>,
}

impl Appliance {
    /// Build the runtime from a parsed device description.
    ///
    /// `transport` is shared by every entity and program; unit tests hand
    /// in a fake, production wires in a [`Session`].
    pub fn new(description: DeviceDescription, transport: Arc<dyn Transport>) -> Self {
        Self::with_request_timeout(
            description,
            transport,
            homeconnect_api::session::DEFAULT_REQUEST_TIMEOUT,
        )
    }

    pub fn with_request_timeout(
        description: DeviceDescription,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        let keepalive_uid = infer_keepalive_uid(&description);

        let mut entities_by_uid = HashMap::new();
        let mut uid_by_name = HashMap::new();
        let mut active_program = None;
        let mut selected_program = None;

        for (kind, desc) in description.entities() {
            let entity = Entity::new(
                kind,
                desc.clone(),
                Arc::clone(&transport),
                request_timeout,
            );
            match kind {
                EntityKind::ActiveProgram => active_program = Some(Arc::clone(&entity)),
                EntityKind::SelectedProgram => selected_program = Some(Arc::clone(&entity)),
                _ => {}
            }
            if !desc.name.is_empty() {
                uid_by_name.insert(desc.name.clone(), desc.uid);
            }
            entities_by_uid.insert(desc.uid, entity);
        }

        let programs = description
            .program
            .iter()
            .map(|desc| {
                (
                    desc.uid,
                    Program::new(desc.clone(), Arc::clone(&transport), request_timeout),
                )
            })
            .collect();

        debug!(
            entities = entities_by_uid.len(),
            programs = description.program.len(),
            "appliance runtime built"
        );

        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ApplianceInner {
                info: description.info,
                entities_by_uid,
                uid_by_name,
                programs,
                active_program,
                selected_program,
                keepalive_uid,
                update_tx,
            }),
        }
    }

    /// Wire this appliance into a session: register the notification
    /// callback (held weakly, so dropping the appliance unhooks it) and
    /// configure the inferred keepalive uid if the caller has not set one.
    pub fn attach(&self, session: &Session) {
        if session.keepalive_uid().is_none() {
            session.set_keepalive_uid(self.inner.keepalive_uid);
        }
        let weak: Weak<ApplianceInner> = Arc::downgrade(&self.inner);
        session.set_notify_callback(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_notification(&message);
            }
        });
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    /// Keepalive probe uid inferred from the description.
    pub fn keepalive_uid(&self) -> Option<u32> {
        self.inner.keepalive_uid
    }

    pub fn entity_by_uid(&self, uid: u32) -> Option<Arc<Entity>> {
        self.inner.entities_by_uid.get(&uid).cloned()
    }

    pub fn entity(&self, name: &str) -> Option<Arc<Entity>> {
        let uid = self.inner.uid_by_name.get(name)?;
        self.entity_by_uid(*uid)
    }

    /// Entity lookup that fails loudly, for operation dispatch.
    pub fn require_entity(&self, name: &str) -> Result<Arc<Entity>> {
        self.entity(name)
            .ok_or_else(|| CoreError::UnknownEntity(name.to_string()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.inner.entities_by_uid.values()
    }

    pub fn entities_by_uid(&self) -> &HashMap<u32, Arc<Entity>> {
        &self.inner.entities_by_uid
    }

    pub fn program(&self, uid: u32) -> Option<&Program> {
        self.inner.programs.get(&uid)
    }

    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.inner.programs.values()
    }

    pub fn active_program(&self) -> Option<&Arc<Entity>> {
        self.inner.active_program.as_ref()
    }

    pub fn selected_program(&self) -> Option<&Arc<Entity>> {
        self.inner.selected_program.as_ref()
    }

    /// The role an integration layer should give an entity.
    pub fn role_of(&self, uid: u32) -> Option<EntityRole> {
        let entity = self.inner.entities_by_uid.get(&uid)?;
        Some(classify(entity.kind(), entity.description()))
    }

    /// Execute a command entity (single-shot trigger writing `true`).
    pub async fn run_command(&self, name: &str) -> Result<()> {
        let entity = self.require_entity(name)?;
        if entity.kind() != EntityKind::Command {
            return Err(CoreError::InvalidPayload {
                operation: "command",
                reason: format!("{name} is not a command entity"),
            });
        }
        entity.write(Value::Bool(true)).await
    }

    /// Start whichever program is currently selected, resolving the
    /// program uid from the selected-program entity and filling unset
    /// options from sibling shadow values.
    pub async fn start_selected(
        &self,
        overrides: &[(u32, Value)],
        override_options: bool,
    ) -> Result<()> {
        let selected = self
            .inner
            .selected_program
            .as_ref()
            .ok_or_else(|| CoreError::UnknownEntity("selectedProgram".into()))?;
        let uid = selected
            .value_raw()
            .as_ref()
            .and_then(lenient_i64)
            .and_then(|uid| u32::try_from(uid).ok())
            .ok_or_else(|| CoreError::InvalidPayload {
                operation: "start",
                reason: "no program is selected".into(),
            })?;
        let program = self
            .inner
            .programs
            .get(&uid)
            .ok_or_else(|| CoreError::UnknownEntity(format!("program {uid:#06x}")))?;
        program
            .start(overrides, override_options, Some(&self.inner.entities_by_uid))
            .await
    }

    /// Feed one inbound message into entity state. Normally registered
    /// via [`attach`](Self::attach); public so external dispatchers and
    /// tests can drive it directly.
    pub fn apply_notification(&self, message: &Message) {
        self.inner.apply_notification(message);
    }

    /// Subscribe to applied entity updates. A consumer that falls behind
    /// sees [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe_updates(&self) -> broadcast::Receiver<EntityUpdate> {
        self.inner.update_tx.subscribe()
    }
}

impl ApplianceInner {
    fn apply_notification(&self, message: &Message) {
        match message.resource.as_str() {
            "/ro/values" | "/ro/descriptionChange" => {
                for entry in &message.data {
                    let uid = entry
                        .get("uid")
                        .and_then(lenient_i64)
                        .and_then(|uid| u32::try_from(uid).ok());
                    let Some(uid) = uid else {
                        trace!("notification entry without uid dropped");
                        continue;
                    };
                    match self.entities_by_uid.get(&uid) {
                        Some(entity) => {
                            entity.apply_update(entry);
                            // Send errors only mean nobody is listening.
                            let _ = self.update_tx.send(EntityUpdate {
                                uid,
                                name: entity.name().to_string(),
                                value: entity.value(),
                            });
                        }
                        None => debug!(uid, "notification for unknown entity dropped"),
                    }
                }
            }
            other => trace!(resource = other, "notification not for the entity runtime"),
        }
    }
}

impl std::fmt::Debug for Appliance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appliance")
            .field("entities", &self.inner.entities_by_uid.len())
            .field("programs", &self.inner.programs.len())
            .finish()
    }
}

// ── Classification ───────────────────────────────────────────────────

/// Decide the integration role for one entity.
pub fn classify(kind: EntityKind, desc: &EntityDescription) -> EntityRole {
    match kind {
        EntityKind::Setting => {
            if desc.min.is_some() || desc.max.is_some() || desc.step.is_some() {
                EntityRole::Number
            } else if desc.enum_map.as_ref().is_some_and(|m| m.len() > 2) {
                EntityRole::Select
            } else if is_switchlike(desc) {
                EntityRole::Switch
            } else {
                EntityRole::Sensor
            }
        }
        EntityKind::Status => {
            let two_valued = desc.enum_map.as_ref().is_some_and(|m| m.len() == 2);
            if desc.protocol_type == Some(ProtocolType::Boolean) || two_valued {
                EntityRole::BinarySensor
            } else {
                EntityRole::Sensor
            }
        }
        EntityKind::Command => EntityRole::Command,
        EntityKind::Event => EntityRole::Event,
        EntityKind::Option => EntityRole::Option,
        EntityKind::Program | EntityKind::ActiveProgram | EntityKind::SelectedProgram => {
            EntityRole::Program
        }
    }
}

fn is_switchlike(desc: &EntityDescription) -> bool {
    if desc.protocol_type == Some(ProtocolType::Boolean) {
        return true;
    }
    desc.enum_map
        .as_ref()
        .and_then(|map| on_off_codes(map))
        .is_some()
}

/// Find the (on, off) wire codes in a two-valued enum with recognisable
/// labels. On labels: `on`, `standby`, `true`; off labels: `off`,
/// `mainsoff`, `false` (case-insensitive). Ties resolve to the max key
/// for on and the min key for off.
pub fn on_off_codes(map: &BTreeMap<i64, String>) -> Option<(i64, i64)> {
    if map.len() != 2 {
        return None;
    }
    let on = matching_codes(map, &ON_LABELS).max()?;
    let off = matching_codes(map, &OFF_LABELS).min()?;
    (on != off).then_some((on, off))
}

fn matching_codes<'a>(
    map: &'a BTreeMap<i64, String>,
    labels: &'a [&str],
) -> impl Iterator<Item = i64> + 'a {
    map.iter()
        .filter(move |(_, label)| labels.contains(&label.to_ascii_lowercase().as_str()))
        .map(|(code, _)| *code)
}

// ── Keepalive uid inference ──────────────────────────────────────────

/// Pick the uid the session should probe when the link goes quiet:
/// the first setting; failing that, the first readable status that is
/// not unavailable; failing that, the first status at all.
pub fn infer_keepalive_uid(description: &DeviceDescription) -> Option<u32> {
    if let Some(setting) = description.setting.first() {
        return Some(setting.uid);
    }
    description
        .status
        .iter()
        .find(|s| s.access.is_some_and(Access::readable) && s.available != Some(false))
        .or_else(|| description.status.first())
        .map(|s| s.uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn enum_desc(pairs: &[(i64, &str)]) -> EntityDescription {
        EntityDescription {
            enum_map: Some(
                pairs
                    .iter()
                    .map(|(code, label)| (*code, label.to_string()))
                    .collect(),
            ),
            ..EntityDescription::default()
        }
    }

    #[test]
    fn on_off_detection_standard_pair() {
        let map = BTreeMap::from([(0, "Off".to_string()), (1, "On".to_string())]);
        assert_eq!(on_off_codes(&map), Some((1, 0)));
    }

    #[test]
    fn on_off_detection_power_state_labels() {
        let map = BTreeMap::from([(1, "MainsOff".to_string()), (2, "Standby".to_string())]);
        assert_eq!(on_off_codes(&map), Some((2, 1)));
    }

    #[test]
    fn on_off_detection_needs_both_labels() {
        let map = BTreeMap::from([(0, "Off".to_string()), (1, "Eco".to_string())]);
        assert_eq!(on_off_codes(&map), None);
    }

    #[test]
    fn on_off_detection_rejects_wider_enums() {
        let map = BTreeMap::from([
            (0, "Off".to_string()),
            (1, "On".to_string()),
            (2, "Standby".to_string()),
        ]);
        assert_eq!(on_off_codes(&map), None);
    }

    #[test]
    fn settings_classify_by_shape() {
        let numeric = EntityDescription {
            min: Some(30.0),
            max: Some(250.0),
            step: Some(5.0),
            ..EntityDescription::default()
        };
        assert_eq!(classify(EntityKind::Setting, &numeric), EntityRole::Number);

        let selector = enum_desc(&[(0, "Eco"), (1, "Fast"), (2, "Intensive")]);
        assert_eq!(classify(EntityKind::Setting, &selector), EntityRole::Select);

        let boolean = EntityDescription {
            protocol_type: Some(ProtocolType::Boolean),
            ..EntityDescription::default()
        };
        assert_eq!(classify(EntityKind::Setting, &boolean), EntityRole::Switch);

        let power = enum_desc(&[(1, "MainsOff"), (2, "On")]);
        assert_eq!(classify(EntityKind::Setting, &power), EntityRole::Switch);

        let plain = EntityDescription::default();
        assert_eq!(classify(EntityKind::Setting, &plain), EntityRole::Sensor);
    }

    #[test]
    fn status_classifies_binary_or_plain() {
        let boolean = EntityDescription {
            protocol_type: Some(ProtocolType::Boolean),
            ..EntityDescription::default()
        };
        assert_eq!(
            classify(EntityKind::Status, &boolean),
            EntityRole::BinarySensor
        );

        // Two-valued enums count as binary regardless of labels.
        let two = enum_desc(&[(0, "Open"), (1, "Closed")]);
        assert_eq!(classify(EntityKind::Status, &two), EntityRole::BinarySensor);

        let plain = EntityDescription::default();
        assert_eq!(classify(EntityKind::Status, &plain), EntityRole::Sensor);
    }

    #[test]
    fn keepalive_uid_prefers_first_setting() {
        let description = DeviceDescription {
            setting: vec![
                EntityDescription {
                    uid: 0x17c0,
                    ..EntityDescription::default()
                },
                EntityDescription {
                    uid: 0x17c1,
                    ..EntityDescription::default()
                },
            ],
            ..DeviceDescription::default()
        };
        assert_eq!(infer_keepalive_uid(&description), Some(0x17c0));
    }

    #[test]
    fn keepalive_uid_falls_back_to_readable_status() {
        let description = DeviceDescription {
            status: vec![
                EntityDescription {
                    uid: 0x0200,
                    access: Some(Access::None),
                    available: Some(false),
                    ..EntityDescription::default()
                },
                EntityDescription {
                    uid: 0x0201,
                    access: Some(Access::Read),
                    available: Some(true),
                    ..EntityDescription::default()
                },
            ],
            ..DeviceDescription::default()
        };
        assert_eq!(infer_keepalive_uid(&description), Some(0x0201));
    }

    #[test]
    fn keepalive_uid_last_resort_is_first_status() {
        let description = DeviceDescription {
            status: vec![EntityDescription {
                uid: 0x0300,
                access: Some(Access::None),
                available: Some(false),
                ..EntityDescription::default()
            }],
            ..DeviceDescription::default()
        };
        assert_eq!(infer_keepalive_uid(&description), Some(0x0300));
    }

    #[test]
    fn keepalive_uid_empty_description() {
        assert_eq!(infer_keepalive_uid(&DeviceDescription::default()), None);
    }
}
