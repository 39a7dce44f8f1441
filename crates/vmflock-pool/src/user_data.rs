// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent bootstrap data injected into cloned machines.
//!
//! A freshly cloned machine has no way to know who it is. The provisioner
//! writes these values into the clone's guest properties; the agent software
//! inside the guest reads them on boot to name itself and connect back to the
//! build server.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Guest property keys readable from inside the machine.
pub mod guest_properties {
    /// Agent display name.
    pub const AGENT_NAME: &str = "guestinfo.agentName";
    /// One-time token the agent authorizes with.
    pub const AUTH_TOKEN: &str = "guestinfo.authToken";
    /// Build server URL the agent connects back to.
    pub const SERVER_URL: &str = "guestinfo.serverUrl";
    /// Name of the instance, as tracked by the pool.
    pub const INSTANCE_NAME: &str = "guestinfo.instanceName";
    /// Name of the image the instance was cloned from.
    pub const IMAGE_NAME: &str = "guestinfo.imageName";
    /// Full serialized user data.
    pub const USER_DATA: &str = "guestinfo.userData";
}

/// Bootstrap data for one agent instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUserData {
    /// Agent display name on the build server.
    pub agent_name: String,
    /// One-time authorization token.
    pub auth_token: String,
    /// Build server URL.
    pub server_url: String,
    /// Cloud profile this instance belongs to.
    pub profile_id: String,
    /// Additional properties passed through to the guest.
    #[serde(default)]
    pub custom_properties: HashMap<String, String>,
}

impl AgentUserData {
    /// Render the guest property map for a clone of `image_name` named
    /// `instance_name`.
    ///
    /// Custom properties are applied first so the reserved keys always win.
    pub fn guest_properties(
        &self,
        instance_name: &str,
        image_name: &str,
    ) -> HashMap<String, String> {
        let mut properties = self.custom_properties.clone();
        properties.insert(
            guest_properties::AGENT_NAME.to_string(),
            self.agent_name.clone(),
        );
        properties.insert(
            guest_properties::AUTH_TOKEN.to_string(),
            self.auth_token.clone(),
        );
        properties.insert(
            guest_properties::SERVER_URL.to_string(),
            self.server_url.clone(),
        );
        properties.insert(
            guest_properties::INSTANCE_NAME.to_string(),
            instance_name.to_string(),
        );
        properties.insert(
            guest_properties::IMAGE_NAME.to_string(),
            image_name.to_string(),
        );
        if let Ok(serialized) = serde_json::to_string(self) {
            properties.insert(guest_properties::USER_DATA.to_string(), serialized);
        }
        properties
    }
}
