// ── Program operations ──
//
// Programs are selected (made current without running) via
// /ro/selectedProgram and started via /ro/activeProgram. Starting merges
// options: caller overrides first, then -- unless suppressed -- the
// acknowledged (shadow) values of the program's remaining options, in
// profile order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use homeconnect_api::{Action, Message, Transport};

use crate::describe::{Access, EntityDescription, Execution};
use crate::entity::Entity;
use crate::error::Result;

/// One program from the device description, bound to a transport.
pub struct Program {
    desc: EntityDescription,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl Program {
    pub(crate) fn new(
        desc: EntityDescription,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            desc,
            transport,
            request_timeout,
        }
    }

    pub fn uid(&self) -> u32 {
        self.desc.uid
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn execution(&self) -> Option<Execution> {
        self.desc.execution
    }

    /// Option entity uids in profile order.
    pub fn option_uids(&self) -> &[u32] {
        &self.desc.option_uids
    }

    /// Make this the selected program, with an empty option list.
    pub async fn select(&self) -> Result<()> {
        let message = Message {
            resource: "/ro/selectedProgram".into(),
            action: Action::Post,
            data: vec![json!({ "program": self.desc.uid, "options": [] })],
            ..Message::default()
        };
        self.transport
            .send_sync(message, self.request_timeout)
            .await?;
        Ok(())
    }

    /// Start this program.
    ///
    /// `overrides` are emitted first, in the order given (a value may be
    /// JSON null). When `override_options` is false and an entity
    /// registry is supplied, each of the program's option uids not
    /// present in `overrides` contributes its shadow value -- but only if
    /// the option is ReadWrite and has an acknowledged value at all.
    pub async fn start(
        &self,
        overrides: &[(u32, Value)],
        override_options: bool,
        entities: Option<&HashMap<u32, Arc<Entity>>>,
    ) -> Result<()> {
        let mut options: Vec<Value> = overrides
            .iter()
            .map(|(uid, value)| json!({ "uid": uid, "value": value }))
            .collect();

        if !override_options {
            if let Some(registry) = entities {
                for uid in &self.desc.option_uids {
                    if overrides.iter().any(|(o, _)| o == uid) {
                        continue;
                    }
                    let Some(entity) = registry.get(uid) else {
                        continue;
                    };
                    if entity.access() != Some(Access::ReadWrite) {
                        continue;
                    }
                    if let Some(shadow) = entity.shadow_raw() {
                        options.push(json!({ "uid": uid, "value": shadow }));
                    }
                }
            }
        }

        let message = Message {
            resource: "/ro/activeProgram".into(),
            action: Action::Post,
            data: vec![json!({ "program": self.desc.uid, "options": options })],
            ..Message::default()
        };
        self.transport
            .send_sync(message, self.request_timeout)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("uid", &self.desc.uid)
            .field("name", &self.desc.name)
            .field("options", &self.desc.option_uids)
            .finish()
    }
}
