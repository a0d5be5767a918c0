//! Identity normalization: raw directory rows → [`ResolvedIdentity`].
//!
//! - No IO
//! - No panics
//! - Absent rows are defaults, never errors

use serde::{Deserialize, Serialize};

use tradepost_core::BusinessId;

use crate::{MembershipRow, ProfileRow, Role, RoleRow};

/// Profile shown for the acting principal.
///
/// For a delegate this is synthesized: `name` is the delegate's own name and
/// the business fields come from the parent business.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayProfile {
    pub name: Option<String>,
    pub business_name: Option<String>,
    pub legal_name: Option<String>,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    /// Set only when acting on behalf of another business.
    #[serde(default)]
    pub parent_business_id: Option<BusinessId>,
}

impl DisplayProfile {
    fn from_own(profile: &ProfileRow) -> Self {
        Self {
            name: Some(profile.display_name.clone()),
            business_name: Some(profile.display_name.clone()),
            legal_name: profile.legal_name.clone(),
            phone: profile.phone.clone(),
            avatar_url: profile.avatar_url.clone(),
            parent_business_id: None,
        }
    }

    fn for_delegate(membership: &MembershipRow, parent: Option<&ProfileRow>) -> Self {
        Self {
            name: Some(membership.display_name.clone()),
            business_name: parent.map(|p| p.display_name.clone()),
            legal_name: parent.and_then(|p| p.legal_name.clone()),
            phone: parent.and_then(|p| p.phone.clone()),
            avatar_url: parent.and_then(|p| p.avatar_url.clone()),
            parent_business_id: Some(membership.parent_business_id),
        }
    }

    pub fn is_delegated(&self) -> bool {
        self.parent_business_id.is_some()
    }
}

/// The single normalized output of resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub role: Option<Role>,
    pub is_approved: bool,
    pub is_delegated: bool,
    pub display_profile: DisplayProfile,
}

impl ResolvedIdentity {
    /// No role, not approved, empty profile.
    pub fn unassigned() -> Self {
        Self {
            role: None,
            is_approved: false,
            is_delegated: false,
            display_profile: DisplayProfile::default(),
        }
    }
}

/// Everything the directory returned for one user.
///
/// `parent_profile` is only looked up when `membership` is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawIdentity {
    pub role: Option<RoleRow>,
    pub profile: Option<ProfileRow>,
    pub membership: Option<MembershipRow>,
    pub parent_profile: Option<ProfileRow>,
}

impl RawIdentity {
    /// The membership, if it is present and active.
    pub fn active_membership(&self) -> Option<&MembershipRow> {
        self.membership.as_ref().filter(|m| m.is_active)
    }
}

/// Apply the precedence rule (first match wins):
///
/// 1. active delegation → ordering, approved, parent business profile
/// 2. admin / supplier → approved
/// 3. ordering → approved iff the profile says so
/// 4. nothing → no role, not approved
pub fn resolve_identity(raw: &RawIdentity) -> ResolvedIdentity {
    if let Some(membership) = raw.active_membership() {
        return ResolvedIdentity {
            role: Some(Role::BusinessOrdering),
            is_approved: true,
            is_delegated: true,
            display_profile: DisplayProfile::for_delegate(
                membership,
                raw.parent_profile.as_ref(),
            ),
        };
    }

    let display_profile = raw
        .profile
        .as_ref()
        .map(DisplayProfile::from_own)
        .unwrap_or_default();

    match raw.role.as_ref().map(|r| r.role) {
        Some(role) if role.is_implicitly_approved() => ResolvedIdentity {
            role: Some(role),
            is_approved: true,
            is_delegated: false,
            display_profile,
        },
        Some(Role::BusinessOrdering) => ResolvedIdentity {
            role: Some(Role::BusinessOrdering),
            is_approved: raw.profile.as_ref().is_some_and(|p| p.is_approved),
            is_delegated: false,
            display_profile,
        },
        Some(_) | None => ResolvedIdentity {
            display_profile,
            ..ResolvedIdentity::unassigned()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tradepost_core::{MembershipId, UserId};

    fn role_row(user_id: UserId, role: Role) -> RoleRow {
        RoleRow { user_id, role }
    }

    fn profile_row(user_id: UserId, name: &str, is_approved: bool) -> ProfileRow {
        ProfileRow {
            user_id,
            display_name: name.to_string(),
            legal_name: Some(format!("{name} LLC")),
            phone: Some("+1 555 0100".to_string()),
            avatar_url: Some(format!("https://cdn.example/{name}.png")),
            is_approved,
        }
    }

    fn membership_row(user_id: UserId, parent: UserId, name: &str, active: bool) -> MembershipRow {
        MembershipRow {
            membership_id: MembershipId::new(),
            user_id,
            parent_business_id: BusinessId::from(parent),
            display_name: name.to_string(),
            is_active: active,
        }
    }

    #[test]
    fn supplier_without_profile_is_approved() {
        let u1 = UserId::new();
        let raw = RawIdentity {
            role: Some(role_row(u1, Role::BusinessSupplying)),
            ..Default::default()
        };

        let resolved = resolve_identity(&raw);
        assert_eq!(resolved.role, Some(Role::BusinessSupplying));
        assert!(resolved.is_approved);
        assert_eq!(resolved.display_profile, DisplayProfile::default());
    }

    #[test]
    fn unapproved_ordering_business_stays_pending() {
        let u2 = UserId::new();
        let raw = RawIdentity {
            role: Some(role_row(u2, Role::BusinessOrdering)),
            profile: Some(profile_row(u2, "Bistro", false)),
            ..Default::default()
        };

        let resolved = resolve_identity(&raw);
        assert_eq!(resolved.role, Some(Role::BusinessOrdering));
        assert!(!resolved.is_approved);
        assert_eq!(resolved.display_profile.name.as_deref(), Some("Bistro"));
    }

    #[test]
    fn ordering_business_without_profile_is_not_approved() {
        let user = UserId::new();
        let raw = RawIdentity {
            role: Some(role_row(user, Role::BusinessOrdering)),
            ..Default::default()
        };
        assert!(!resolve_identity(&raw).is_approved);
    }

    #[test]
    fn inactive_membership_falls_through_to_own_role() {
        let u3 = UserId::new();
        let parent = UserId::new();
        let raw = RawIdentity {
            role: Some(role_row(u3, Role::BusinessSupplying)),
            membership: Some(membership_row(u3, parent, "Former Staff", false)),
            ..Default::default()
        };

        let resolved = resolve_identity(&raw);
        assert_eq!(resolved.role, Some(Role::BusinessSupplying));
        assert!(!resolved.is_delegated);
        assert_eq!(resolved.display_profile.parent_business_id, None);
    }

    #[test]
    fn inactive_membership_only_resolves_to_nothing() {
        let u3 = UserId::new();
        let raw = RawIdentity {
            membership: Some(membership_row(u3, UserId::new(), "Former Staff", false)),
            ..Default::default()
        };
        assert_eq!(resolve_identity(&raw), ResolvedIdentity::unassigned());
    }

    #[test]
    fn delegate_uses_own_name_and_parent_business_fields() {
        let staff = UserId::new();
        let owner = UserId::new();
        let raw = RawIdentity {
            role: Some(role_row(staff, Role::BusinessOrdering)),
            profile: Some(profile_row(staff, "Staff Own Profile", false)),
            membership: Some(membership_row(staff, owner, "Sam (floor manager)", true)),
            parent_profile: Some(profile_row(owner, "Bistro", false)),
        };

        let resolved = resolve_identity(&raw);
        assert_eq!(resolved.role, Some(Role::BusinessOrdering));
        assert!(resolved.is_approved);
        assert!(resolved.is_delegated);
        let profile = &resolved.display_profile;
        assert_eq!(profile.name.as_deref(), Some("Sam (floor manager)"));
        assert_eq!(profile.business_name.as_deref(), Some("Bistro"));
        assert_eq!(profile.legal_name.as_deref(), Some("Bistro LLC"));
        assert_eq!(profile.parent_business_id, Some(BusinessId::from(owner)));
    }

    #[test]
    fn delegate_without_parent_profile_has_empty_business_fields() {
        let staff = UserId::new();
        let raw = RawIdentity {
            membership: Some(membership_row(staff, UserId::new(), "Sam", true)),
            ..Default::default()
        };

        let resolved = resolve_identity(&raw);
        assert!(resolved.is_approved);
        assert_eq!(resolved.display_profile.name.as_deref(), Some("Sam"));
        assert_eq!(resolved.display_profile.business_name, None);
        assert_eq!(resolved.display_profile.phone, None);
        assert_eq!(resolved.display_profile.avatar_url, None);
    }

    fn any_role() -> impl Strategy<Value = Option<Role>> {
        prop_oneof![
            Just(None),
            Just(Some(Role::Admin)),
            Just(Some(Role::BusinessOrdering)),
            Just(Some(Role::BusinessSupplying)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: an active membership always wins, whatever else is present.
        #[test]
        fn active_membership_always_wins(
            role in any_role(),
            has_profile in any::<bool>(),
            profile_approved in any::<bool>(),
            has_parent in any::<bool>(),
        ) {
            let user = UserId::new();
            let owner = UserId::new();
            let raw = RawIdentity {
                role: role.map(|r| role_row(user, r)),
                profile: has_profile.then(|| profile_row(user, "own", profile_approved)),
                membership: Some(membership_row(user, owner, "delegate", true)),
                parent_profile: has_parent.then(|| profile_row(owner, "parent", false)),
            };

            let resolved = resolve_identity(&raw);
            prop_assert_eq!(resolved.role, Some(Role::BusinessOrdering));
            prop_assert!(resolved.is_approved);
            prop_assert!(resolved.is_delegated);
            prop_assert_eq!(resolved.display_profile.name.as_deref(), Some("delegate"));
        }

        /// Property: without delegation only ordering businesses can be pending,
        /// and they are approved exactly when their profile says so.
        #[test]
        fn approval_without_delegation(
            role in any_role(),
            has_profile in any::<bool>(),
            profile_approved in any::<bool>(),
        ) {
            let user = UserId::new();
            let raw = RawIdentity {
                role: role.map(|r| role_row(user, r)),
                profile: has_profile.then(|| profile_row(user, "own", profile_approved)),
                ..Default::default()
            };

            let resolved = resolve_identity(&raw);
            prop_assert_eq!(resolved.role, role);
            prop_assert!(!resolved.is_delegated);
            let expected = match role {
                None => false,
                Some(Role::BusinessOrdering) => has_profile && profile_approved,
                Some(_) => true,
            };
            prop_assert_eq!(resolved.is_approved, expected);
        }
    }
}
