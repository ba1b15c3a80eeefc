use std::fmt;

use crate::error::ValidationError;

const MAX_TASK_ID_LEN: usize = 128;

/// Address of a broadcast room.
///
/// Every key carries the tenant it belongs to, so two tenants whose task ids
/// collide never share a room. The display form matches the wire names used
/// in logs (`task:<taskId>`, `notif:<userId>`, `notif_admin:<tenantId>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Task { tenant_id: String, task_id: String },
    Notif { tenant_id: String, user_id: String },
    NotifAdmin { tenant_id: String },
}

impl RoomKey {
    /// Builds a task room key from a client-supplied task id.
    pub fn task(tenant_id: &str, task_id: &str) -> Result<Self, ValidationError> {
        let task_id = task_id.trim();
        let well_formed = !task_id.is_empty()
            && task_id.len() <= MAX_TASK_ID_LEN
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !well_formed {
            return Err(ValidationError::InvalidRoomKey(format!("task:{task_id}")));
        }
        Ok(RoomKey::Task {
            tenant_id: tenant_id.to_string(),
            task_id: task_id.to_string(),
        })
    }

    pub fn notif(tenant_id: &str, user_id: &str) -> Self {
        RoomKey::Notif {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
        }
    }

    pub fn notif_admin(tenant_id: &str) -> Self {
        RoomKey::NotifAdmin {
            tenant_id: tenant_id.to_string(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            RoomKey::Task { tenant_id, .. }
            | RoomKey::Notif { tenant_id, .. }
            | RoomKey::NotifAdmin { tenant_id } => tenant_id,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Task { task_id, .. } => write!(f, "task:{task_id}"),
            RoomKey::Notif { user_id, .. } => write!(f, "notif:{user_id}"),
            RoomKey::NotifAdmin { tenant_id } => write!(f, "notif_admin:{tenant_id}"),
        }
    }
}
