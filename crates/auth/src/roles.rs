use serde::{Deserialize, Serialize};

/// Role a user acts under in the marketplace.
///
/// A user holds at most one role. Older records use the names `restaurant`
/// and `supplier`; both are accepted when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[serde(alias = "restaurant")]
    BusinessOrdering,
    #[serde(alias = "supplier")]
    BusinessSupplying,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::BusinessOrdering => "business_ordering",
            Role::BusinessSupplying => "business_supplying",
        }
    }

    /// Admins and suppliers are never pending approval.
    pub fn is_implicitly_approved(&self) -> bool {
        matches!(self, Role::Admin | Role::BusinessSupplying)
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_names_decode() {
        let role: Role = serde_json::from_str("\"restaurant\"").unwrap();
        assert_eq!(role, Role::BusinessOrdering);
        let role: Role = serde_json::from_str("\"supplier\"").unwrap();
        assert_eq!(role, Role::BusinessSupplying);
    }

    #[test]
    fn display_matches_serialized_name() {
        for role in [Role::Admin, Role::BusinessOrdering, Role::BusinessSupplying] {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
        }
    }
}
