// ── Parsed-profile model ──
//
// Canonical description of what one appliance can do, as produced by the
// (external) XML profile parser from the feature-mapping and
// device-description documents. The runtime consumes these immutably;
// per-session mutable copies of the changeable fields live in
// `entity::Entity`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Value type of an entity on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolType {
    Boolean,
    Integer,
    Float,
    String,
    Object,
}

/// Access rights the profile (or a later description change) grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    None,
    Read,
    ReadWrite,
    WriteOnly,
    ReadStatic,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite | Access::ReadStatic)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::ReadWrite | Access::WriteOnly)
    }

    /// Parse the wire form used by description-change notifications
    /// (`"readWrite"`, `"read"`, ...). Case-insensitive; unknown forms
    /// count as absent.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Access::None),
            "read" => Some(Access::Read),
            "readwrite" => Some(Access::ReadWrite),
            "writeonly" => Some(Access::WriteOnly),
            "readstatic" => Some(Access::ReadStatic),
            _ => None,
        }
    }
}

/// What a program supports (programs only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Execution {
    None,
    SelectOnly,
    StartOnly,
    SelectAndStart,
}

impl Execution {
    pub fn selectable(self) -> bool {
        matches!(self, Execution::SelectOnly | Execution::SelectAndStart)
    }

    pub fn startable(self) -> bool {
        matches!(self, Execution::StartOnly | Execution::SelectAndStart)
    }
}

/// Which description list an entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Status,
    Setting,
    Event,
    Command,
    Option,
    Program,
    ActiveProgram,
    SelectedProgram,
}

/// One feature of the appliance, as described by the profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityDescription {
    /// 32-bit identifier, hexadecimal in the profile XML.
    pub uid: u32,
    /// Canonical dotted feature name resolved via the feature mapping,
    /// e.g. `"BSH.Common.Setting.PowerState"`.
    pub name: String,
    pub protocol_type: Option<ProtocolType>,
    pub access: Option<Access>,
    /// Tri-valued: `Some(true)` / `Some(false)` / unknown.
    pub available: Option<bool>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    /// Integer wire code to display label, for enumerated entities.
    pub enum_map: Option<BTreeMap<i64, String>>,
    /// Option entity uids, in profile order (programs only).
    pub option_uids: Vec<u32>,
    /// Programs only.
    pub execution: Option<Execution>,
}

impl EntityDescription {
    /// Reverse lookup: label to wire code (exact match first, then
    /// case-insensitive).
    pub fn enum_code(&self, label: &str) -> Option<i64> {
        let map = self.enum_map.as_ref()?;
        map.iter()
            .find(|(_, l)| l.as_str() == label)
            .or_else(|| map.iter().find(|(_, l)| l.eq_ignore_ascii_case(label)))
            .map(|(code, _)| *code)
    }

    /// Forward lookup: wire code to display label.
    pub fn enum_label(&self, code: i64) -> Option<&str> {
        self.enum_map.as_ref()?.get(&code).map(String::as_str)
    }
}

/// Identity block from the device description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub brand: Option<String>,
    pub appliance_type: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub revision: Option<String>,
}

/// Everything the profile says about one appliance: six categorised
/// entity lists, the two singleton program slots, and the identity block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub status: Vec<EntityDescription>,
    pub setting: Vec<EntityDescription>,
    pub event: Vec<EntityDescription>,
    pub command: Vec<EntityDescription>,
    pub option: Vec<EntityDescription>,
    pub program: Vec<EntityDescription>,
    pub active_program: Option<EntityDescription>,
    pub selected_program: Option<EntityDescription>,
    pub info: DeviceInfo,
}

impl DeviceDescription {
    /// Iterate every entity with the list it came from.
    pub fn entities(&self) -> impl Iterator<Item = (EntityKind, &EntityDescription)> {
        self.status
            .iter()
            .map(|d| (EntityKind::Status, d))
            .chain(self.setting.iter().map(|d| (EntityKind::Setting, d)))
            .chain(self.event.iter().map(|d| (EntityKind::Event, d)))
            .chain(self.command.iter().map(|d| (EntityKind::Command, d)))
            .chain(self.option.iter().map(|d| (EntityKind::Option, d)))
            .chain(self.program.iter().map(|d| (EntityKind::Program, d)))
            .chain(
                self.active_program
                    .iter()
                    .map(|d| (EntityKind::ActiveProgram, d)),
            )
            .chain(
                self.selected_program
                    .iter()
                    .map(|d| (EntityKind::SelectedProgram, d)),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_wire_forms() {
        assert_eq!(Access::from_wire("readWrite"), Some(Access::ReadWrite));
        assert_eq!(Access::from_wire("READSTATIC"), Some(Access::ReadStatic));
        assert_eq!(Access::from_wire("writeOnly"), Some(Access::WriteOnly));
        assert_eq!(Access::from_wire("banana"), None);
    }

    #[test]
    fn access_predicates() {
        assert!(Access::ReadStatic.readable());
        assert!(!Access::WriteOnly.readable());
        assert!(Access::WriteOnly.writable());
        assert!(!Access::Read.writable());
        assert!(!Access::None.readable());
    }

    #[test]
    fn enum_lookup_both_ways() {
        let desc = EntityDescription {
            enum_map: Some(BTreeMap::from([(0, "Off".into()), (1, "On".into())])),
            ..EntityDescription::default()
        };
        assert_eq!(desc.enum_label(1), Some("On"));
        assert_eq!(desc.enum_code("Off"), Some(0));
        assert_eq!(desc.enum_code("off"), Some(0));
        assert_eq!(desc.enum_code("Missing"), None);
    }

    #[test]
    fn entities_iterates_all_lists() {
        let mk = |uid| EntityDescription {
            uid,
            ..EntityDescription::default()
        };
        let desc = DeviceDescription {
            status: vec![mk(1)],
            setting: vec![mk(2), mk(3)],
            command: vec![mk(4)],
            active_program: Some(mk(5)),
            ..DeviceDescription::default()
        };
        let uids: Vec<u32> = desc.entities().map(|(_, d)| d.uid).collect();
        assert_eq!(uids, vec![1, 2, 3, 4, 5]);
    }
}
