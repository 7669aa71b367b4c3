//! Access policy.
//!
//! Every permission decision in the service goes through [`authorize`].
//! Roles do not form a hierarchy; each action lists the roles it accepts.

use std::collections::BTreeSet;

use crate::domain::{Role, User, UserId};
use crate::error::AccessError;

/// Who is making a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<UserId>,
    pub roles: BTreeSet<Role>,
}

impl Actor {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: UserId, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            user_id: Some(user_id),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn is_staff(&self) -> bool {
        !self.roles.is_empty()
    }

    pub fn has_any(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| self.roles.contains(r))
    }

    /// The authenticated user's id, or `Unauthenticated`.
    pub fn require_user(&self) -> Result<UserId, AccessError> {
        self.user_id.ok_or(AccessError::Unauthenticated)
    }
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self::user(user.id, user.roles.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReadCatalog,
    Quote,
    ManageCurrencies,
    ManageRates,
    ViewAllRates,
    ManageBranches,
    ViewBalances,
    RecordPurchase,
    CreateOrder,
    TrackOrder,
    ListOrders,
    ViewOrder,
    AttachDocument,
    ChangeOrderStatus,
    DeleteOrder,
    ListPublicReviews,
    ListReviews,
    CreateReview,
    ModerateReviews,
    ManageProfile,
    ManageRoles,
}

/// What the action touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Not owned by anyone in particular
    Shared,
    /// Owned by a user; `None` for guest orders
    OwnedBy(Option<UserId>),
}

const ADMINS: &[Role] = &[Role::Administrator, Role::Owner];
const OWNERS: &[Role] = &[Role::Owner];
const STAFF: &[Role] = &[Role::Operator, Role::Administrator, Role::Owner];

pub fn authorize(actor: &Actor, action: Action, resource: Resource) -> Result<(), AccessError> {
    use Action::*;

    match action {
        ReadCatalog | Quote | CreateOrder | TrackOrder | ListPublicReviews => Ok(()),
        _ if !actor.is_authenticated() => Err(AccessError::Unauthenticated),
        ListOrders | ListReviews | ManageProfile => Ok(()),
        ManageCurrencies | ManageRates | ViewAllRates | DeleteOrder | ModerateReviews => {
            require_role(actor, ADMINS, action)
        }
        ManageBranches | ViewBalances | RecordPurchase | ManageRoles => {
            require_role(actor, OWNERS, action)
        }
        ChangeOrderStatus => require_role(actor, STAFF, action),
        ViewOrder | AttachDocument => {
            if actor.has_any(STAFF) || owns(actor, resource) {
                Ok(())
            } else {
                Err(AccessError::Forbidden(format!("{:?} on another user's order", action)))
            }
        }
        CreateReview => {
            if owns(actor, resource) {
                Ok(())
            } else {
                Err(AccessError::Forbidden(
                    "Only the order's client can review it".into(),
                ))
            }
        }
    }
}

fn require_role(actor: &Actor, roles: &[Role], action: Action) -> Result<(), AccessError> {
    if actor.has_any(roles) {
        Ok(())
    } else {
        Err(AccessError::Forbidden(format!(
            "{:?} requires one of: {}",
            action,
            roles
                .iter()
                .map(Role::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}

fn owns(actor: &Actor, resource: Resource) -> bool {
    match (actor.user_id, resource) {
        (Some(me), Resource::OwnedBy(Some(owner))) => me == owner,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Actor {
        Actor::user(UserId::new(), [])
    }

    fn with(role: Role) -> Actor {
        Actor::user(UserId::new(), [role])
    }

    #[test]
    fn test_public_actions_allow_anonymous() {
        let anon = Actor::anonymous();
        for action in [
            Action::ReadCatalog,
            Action::Quote,
            Action::CreateOrder,
            Action::TrackOrder,
            Action::ListPublicReviews,
        ] {
            assert!(authorize(&anon, action, Resource::Shared).is_ok());
        }
    }

    #[test]
    fn test_anonymous_is_unauthenticated_elsewhere() {
        let anon = Actor::anonymous();
        assert_eq!(
            authorize(&anon, Action::ListOrders, Resource::Shared),
            Err(AccessError::Unauthenticated)
        );
        assert_eq!(
            authorize(&anon, Action::ManageRates, Resource::Shared),
            Err(AccessError::Unauthenticated)
        );
    }

    #[test]
    fn test_catalog_management() {
        assert!(authorize(&with(Role::Administrator), Action::ManageRates, Resource::Shared).is_ok());
        assert!(authorize(&with(Role::Owner), Action::ManageCurrencies, Resource::Shared).is_ok());
        assert!(matches!(
            authorize(&with(Role::Operator), Action::ManageRates, Resource::Shared),
            Err(AccessError::Forbidden(_))
        ));
        assert!(authorize(&with(Role::Administrator), Action::ManageBranches, Resource::Shared).is_err());
        assert!(authorize(&with(Role::Owner), Action::ManageBranches, Resource::Shared).is_ok());
    }

    #[test]
    fn test_balances_are_owner_only() {
        for role in [Role::Operator, Role::Administrator] {
            assert!(authorize(&with(role), Action::ViewBalances, Resource::Shared).is_err());
            assert!(authorize(&with(role), Action::RecordPurchase, Resource::Shared).is_err());
        }
        assert!(authorize(&with(Role::Owner), Action::RecordPurchase, Resource::Shared).is_ok());
    }

    #[test]
    fn test_order_access() {
        let me = client();
        let mine = Resource::OwnedBy(me.user_id);
        let theirs = Resource::OwnedBy(Some(UserId::new()));
        let guest = Resource::OwnedBy(None);

        assert!(authorize(&me, Action::ViewOrder, mine).is_ok());
        assert!(authorize(&me, Action::ViewOrder, theirs).is_err());
        assert!(authorize(&me, Action::ViewOrder, guest).is_err());
        assert!(authorize(&with(Role::Operator), Action::ViewOrder, guest).is_ok());

        assert!(authorize(&me, Action::ChangeOrderStatus, mine).is_err());
        assert!(authorize(&with(Role::Operator), Action::ChangeOrderStatus, theirs).is_ok());

        assert!(authorize(&with(Role::Operator), Action::DeleteOrder, theirs).is_err());
        assert!(authorize(&with(Role::Administrator), Action::DeleteOrder, theirs).is_ok());
    }

    #[test]
    fn test_reviews() {
        let me = client();
        assert!(authorize(&me, Action::CreateReview, Resource::OwnedBy(me.user_id)).is_ok());
        assert!(authorize(&with(Role::Owner), Action::CreateReview, Resource::OwnedBy(me.user_id)).is_err());
        assert!(authorize(&me, Action::ModerateReviews, Resource::Shared).is_err());
        assert!(authorize(&with(Role::Administrator), Action::ModerateReviews, Resource::Shared).is_ok());
    }

    #[test]
    fn test_role_management_is_owner_only() {
        assert!(authorize(&with(Role::Administrator), Action::ManageRoles, Resource::Shared).is_err());
        assert!(authorize(&with(Role::Owner), Action::ManageRoles, Resource::Shared).is_ok());
    }
}
