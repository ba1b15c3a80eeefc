//! Lookups against the user directory owned by the auth service.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::doc;
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::error::DirectoryError;

#[async_trait]
pub trait Directory: Send + Sync {
    /// Every user of the tenant whose role receives admin notifications.
    async fn admin_capable_users(&self, tenant_id: &str) -> Result<Vec<String>, DirectoryError>;

    async fn display_name(&self, user_id: &str) -> Result<String, DirectoryError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDocument {
    pub user_id: String,
    pub tenant_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub role: Role,
}

impl UserDocument {
    fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.user_id.clone())
    }
}

/// Reads the `users` collection.
pub struct MongoDirectory {
    users: Collection<UserDocument>,
}

impl MongoDirectory {
    pub fn new(db: &Database) -> Self {
        MongoDirectory {
            users: db.collection::<UserDocument>("users"),
        }
    }
}

#[async_trait]
impl Directory for MongoDirectory {
    async fn admin_capable_users(&self, tenant_id: &str) -> Result<Vec<String>, DirectoryError> {
        let filter = doc! { "tenant_id": tenant_id, "role": { "$in": ["owner", "admin"] } };
        let users: Vec<UserDocument> = self.users.find(filter).await?.try_collect().await?;
        Ok(users.into_iter().map(|u| u.user_id).collect())
    }

    async fn display_name(&self, user_id: &str) -> Result<String, DirectoryError> {
        match self.users.find_one(doc! { "user_id": user_id }).await? {
            Some(user) => Ok(user.display_name()),
            None => Err(DirectoryError::Lookup(format!("unknown user {user_id}"))),
        }
    }
}

/// Fixed user table, for the in-memory backend and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    users: HashMap<String, UserDocument>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: &str, tenant_id: &str, name: &str, role: Role) -> Self {
        self.users.insert(
            user_id.to_string(),
            UserDocument {
                user_id: user_id.to_string(),
                tenant_id: tenant_id.to_string(),
                username: Some(name.to_string()),
                email: None,
                role,
            },
        );
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn admin_capable_users(&self, tenant_id: &str) -> Result<Vec<String>, DirectoryError> {
        let mut admins: Vec<String> = self
            .users
            .values()
            .filter(|u| u.tenant_id == tenant_id && u.role.is_admin_capable())
            .map(|u| u.user_id.clone())
            .collect();
        admins.sort();
        Ok(admins)
    }

    async fn display_name(&self, user_id: &str) -> Result<String, DirectoryError> {
        self.users
            .get(user_id)
            .map(UserDocument::display_name)
            .ok_or_else(|| DirectoryError::Lookup(format!("unknown user {user_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_filters_admins_by_tenant() {
        let dir = StaticDirectory::new()
            .with_user("a1", "t1", "Ada", Role::Admin)
            .with_user("o1", "t1", "Otto", Role::Owner)
            .with_user("m1", "t1", "Mia", Role::Member)
            .with_user("a2", "t2", "Alan", Role::Admin);
        assert_eq!(dir.admin_capable_users("t1").await.unwrap(), vec!["a1", "o1"]);
        assert_eq!(dir.display_name("m1").await.unwrap(), "Mia");
        assert!(dir.display_name("ghost").await.is_err());
    }
}
