use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{PermissionGrant, Principal, ResourceRef, Role, User};
use crate::storage::{GrantTransaction, PermissionStore, UserDirectory};

/// Role-based access control over short links and reports.
///
/// Every mutation runs inside one [`GrantTransaction`], which serializes
/// writers per resource. Two rules hold for every resource:
/// nobody changes their own grant, and the last ADMIN cannot be demoted
/// or removed.
#[derive(Clone)]
pub struct AccessController {
    permissions: Arc<dyn PermissionStore>,
    users: Arc<dyn UserDirectory>,
}

impl AccessController {
    pub fn new(permissions: Arc<dyn PermissionStore>, users: Arc<dyn UserDirectory>) -> Self {
        Self { permissions, users }
    }

    /// Make `creator_id` the first ADMIN of a freshly created resource.
    pub async fn grant_admin_to_creator(
        &self,
        resource: &ResourceRef,
        creator_id: &str,
    ) -> Result<PermissionGrant> {
        let mut tx = self.permissions.begin(resource).await?;

        if !tx.list().await?.is_empty() {
            warn!(resource = %resource, creator_id = %creator_id, "resource already has grants");
            return Err(Error::conflict(format!("{resource} already has an admin")));
        }

        tx.upsert(creator_id, Role::Admin).await?;
        tx.commit().await?;

        info!(resource = %resource, user_id = %creator_id, "granted admin to creator");
        Ok(PermissionGrant {
            resource: resource.clone(),
            user_id: creator_id.to_string(),
            role: Role::Admin,
        })
    }

    pub async fn add_permission(
        &self,
        resource: &ResourceRef,
        acting: &Principal,
        target_login: &str,
        role: Role,
    ) -> Result<PermissionGrant> {
        let target = self.lookup_target(resource, acting, target_login).await?;

        let mut tx = self.permissions.begin(resource).await?;
        require_admin(tx.as_mut(), resource, acting).await?;
        let target = target.ok_or_else(|| Error::not_found(format!("user '{target_login}'")))?;

        if tx.get(&target.id).await?.is_some() {
            return Err(Error::conflict(format!(
                "'{target_login}' already has access to {resource}"
            )));
        }

        tx.upsert(&target.id, role).await?;
        tx.commit().await?;

        info!(
            resource = %resource,
            actor = %acting.login,
            target = %target_login,
            role = %role,
            "permission added"
        );
        Ok(PermissionGrant {
            resource: resource.clone(),
            user_id: target.id,
            role,
        })
    }

    pub async fn update_permission_role(
        &self,
        resource: &ResourceRef,
        acting: &Principal,
        target_login: &str,
        new_role: Role,
    ) -> Result<PermissionGrant> {
        let target = self.lookup_target(resource, acting, target_login).await?;

        let mut tx = self.permissions.begin(resource).await?;
        require_admin(tx.as_mut(), resource, acting).await?;
        let target = target.ok_or_else(|| Error::not_found(format!("user '{target_login}'")))?;

        let current = tx.get(&target.id).await?.ok_or_else(|| {
            Error::not_found(format!("permission for '{target_login}' on {resource}"))
        })?;

        if current == Role::Admin && new_role != Role::Admin {
            ensure_not_last_admin(tx.as_mut(), resource, target_login).await?;
        }

        tx.upsert(&target.id, new_role).await?;
        tx.commit().await?;

        info!(
            resource = %resource,
            actor = %acting.login,
            target = %target_login,
            from = %current,
            to = %new_role,
            "permission role updated"
        );
        Ok(PermissionGrant {
            resource: resource.clone(),
            user_id: target.id,
            role: new_role,
        })
    }

    pub async fn remove_permission(
        &self,
        resource: &ResourceRef,
        acting: &Principal,
        target_login: &str,
    ) -> Result<()> {
        let target = self.lookup_target(resource, acting, target_login).await?;

        let mut tx = self.permissions.begin(resource).await?;
        require_admin(tx.as_mut(), resource, acting).await?;
        let target = target.ok_or_else(|| Error::not_found(format!("user '{target_login}'")))?;

        let current = tx.get(&target.id).await?.ok_or_else(|| {
            Error::not_found(format!("permission for '{target_login}' on {resource}"))
        })?;

        if current == Role::Admin {
            ensure_not_last_admin(tx.as_mut(), resource, target_login).await?;
        }

        tx.delete(&target.id).await?;
        tx.commit().await?;

        info!(
            resource = %resource,
            actor = %acting.login,
            target = %target_login,
            "permission removed"
        );
        Ok(())
    }

    /// Every grant on `resource` except the caller's own. ADMIN only.
    pub async fn get_permissions(
        &self,
        resource: &ResourceRef,
        acting: &Principal,
    ) -> Result<Vec<PermissionGrant>> {
        self.require(resource, &acting.user_id, Role::Admin).await?;

        let grants = self.permissions.list(resource).await?;
        Ok(grants
            .into_iter()
            .filter(|g| g.user_id != acting.user_id)
            .collect())
    }

    pub async fn role_of(&self, resource: &ResourceRef, user_id: &str) -> Result<Option<Role>> {
        Ok(self.permissions.get(resource, user_id).await?)
    }

    /// No grant ranks below VIEWER.
    pub async fn has_at_least(
        &self,
        resource: &ResourceRef,
        user_id: &str,
        min: Role,
    ) -> Result<bool> {
        Ok(self
            .role_of(resource, user_id)
            .await?
            .is_some_and(|role| role.at_least(min)))
    }

    /// Like [`Self::has_at_least`] but fails with `Forbidden`; returns the caller's role.
    pub async fn require(&self, resource: &ResourceRef, user_id: &str, min: Role) -> Result<Role> {
        match self.role_of(resource, user_id).await? {
            Some(role) if role.at_least(min) => Ok(role),
            _ => Err(Error::forbidden(format!("{min} access to {resource} required"))),
        }
    }

    /// Resolve the target login and reject self-targeting before any
    /// transaction is opened. A missing user is reported only after the
    /// actor's role has been checked.
    async fn lookup_target(
        &self,
        resource: &ResourceRef,
        acting: &Principal,
        target_login: &str,
    ) -> Result<Option<User>> {
        if target_login == acting.login {
            return Err(self_target(resource, acting));
        }

        let target = self.users.user_by_login(target_login).await?;
        if target.as_ref().is_some_and(|u| u.id == acting.user_id) {
            return Err(self_target(resource, acting));
        }
        Ok(target)
    }
}

fn self_target(resource: &ResourceRef, acting: &Principal) -> Error {
    warn!(resource = %resource, actor = %acting.login, "rejected change to own permission");
    Error::conflict("cannot change your own permission")
}

async fn require_admin(
    tx: &mut dyn GrantTransaction,
    resource: &ResourceRef,
    acting: &Principal,
) -> Result<()> {
    match tx.get(&acting.user_id).await? {
        Some(Role::Admin) => Ok(()),
        _ => Err(Error::forbidden(format!(
            "admin access to {resource} required"
        ))),
    }
}

async fn ensure_not_last_admin(
    tx: &mut dyn GrantTransaction,
    resource: &ResourceRef,
    target_login: &str,
) -> Result<()> {
    let admins = tx
        .list()
        .await?
        .iter()
        .filter(|g| g.role == Role::Admin)
        .count();

    if admins <= 1 {
        warn!(resource = %resource, target = %target_login, "rejected removal of last admin");
        return Err(Error::conflict(format!(
            "'{target_login}' is the last admin of {resource}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    struct Fixture {
        access: AccessController,
        storage: Arc<MemoryStorage>,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            Self {
                access: AccessController::new(storage.clone(), storage.clone()),
                storage,
            }
        }

        async fn user(&self, login: &str) -> Principal {
            self.storage.create_user(login).await.unwrap().principal()
        }
    }

    #[tokio::test]
    async fn test_creator_grant_happens_once() {
        let fx = Fixture::new();
        let owner = fx.user("owner").await;
        let link = ResourceRef::short_link("abc");

        fx.access.grant_admin_to_creator(&link, &owner.user_id).await.unwrap();
        assert!(fx
            .access
            .has_at_least(&link, &owner.user_id, Role::Admin)
            .await
            .unwrap());

        let err = fx
            .access
            .grant_admin_to_creator(&link, &owner.user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_add_permission_checks() {
        let fx = Fixture::new();
        let owner = fx.user("owner").await;
        let viewer = fx.user("viewer").await;
        let report = ResourceRef::report("r1");
        fx.access.grant_admin_to_creator(&report, &owner.user_id).await.unwrap();

        fx.access
            .add_permission(&report, &owner, "viewer", Role::Viewer)
            .await
            .unwrap();

        let err = fx
            .access
            .add_permission(&report, &owner, "viewer", Role::Editor)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = fx
            .access
            .add_permission(&report, &owner, "ghost", Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = fx
            .access
            .add_permission(&report, &viewer, "ghost", Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_self_service_is_conflict_for_any_role() {
        let fx = Fixture::new();
        let owner = fx.user("owner").await;
        let editor = fx.user("editor").await;
        let link = ResourceRef::short_link("abc");
        fx.access.grant_admin_to_creator(&link, &owner.user_id).await.unwrap();
        fx.access
            .add_permission(&link, &owner, "editor", Role::Editor)
            .await
            .unwrap();

        for actor in [&owner, &editor] {
            let err = fx
                .access
                .update_permission_role(&link, actor, &actor.login, Role::Viewer)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Conflict(_)));

            let err = fx
                .access
                .remove_permission(&link, actor, &actor.login)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Conflict(_)));

            let err = fx
                .access
                .add_permission(&link, actor, &actor.login, Role::Admin)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Conflict(_)));
        }

        assert_eq!(
            fx.access.role_of(&link, &editor.user_id).await.unwrap(),
            Some(Role::Editor)
        );
    }

    #[tokio::test]
    async fn test_second_admin_can_be_demoted_then_removed() {
        let fx = Fixture::new();
        let owner = fx.user("owner").await;
        let _second = fx.user("second").await;
        let report = ResourceRef::report("r1");
        fx.access.grant_admin_to_creator(&report, &owner.user_id).await.unwrap();
        fx.access
            .add_permission(&report, &owner, "second", Role::Admin)
            .await
            .unwrap();

        let grant = fx
            .access
            .update_permission_role(&report, &owner, "second", Role::Viewer)
            .await
            .unwrap();
        assert_eq!(grant.role, Role::Viewer);

        fx.access
            .remove_permission(&report, &owner, "second")
            .await
            .unwrap();

        let err = fx
            .access
            .remove_permission(&report, &owner, "second")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_permissions_excludes_caller() {
        let fx = Fixture::new();
        let owner = fx.user("owner").await;
        let viewer = fx.user("viewer").await;
        let report = ResourceRef::report("r1");
        fx.access.grant_admin_to_creator(&report, &owner.user_id).await.unwrap();
        fx.access
            .add_permission(&report, &owner, "viewer", Role::Viewer)
            .await
            .unwrap();

        let grants = fx.access.get_permissions(&report, &owner).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].user_id, viewer.user_id);
        assert_eq!(grants[0].role, Role::Viewer);

        let err = fx.access.get_permissions(&report, &viewer).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_absent_grant_is_below_viewer() {
        let fx = Fixture::new();
        let stranger = fx.user("stranger").await;
        let link = ResourceRef::short_link("abc");

        assert!(!fx
            .access
            .has_at_least(&link, &stranger.user_id, Role::Viewer)
            .await
            .unwrap());
        assert!(matches!(
            fx.access.require(&link, &stranger.user_id, Role::Viewer).await,
            Err(Error::Forbidden(_))
        ));
    }
}
