use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a dependency node.
///
/// A plain package identifier only carries `package_name`. Searchable name
/// references add an object and a value name, and primary-asset identifiers
/// (used as manage sources) carry a type and a name instead of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct AssetIdentifier {
    pub primary_asset_type: Option<String>,
    pub package_name: Option<String>,
    pub object_name: Option<String>,
    pub value_name: Option<String>,
}

impl AssetIdentifier {
    pub fn package(package_name: impl Into<String>) -> Self {
        Self {
            package_name: Some(package_name.into()),
            ..Self::default()
        }
    }

    pub fn object(package_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            package_name: Some(package_name.into()),
            object_name: Some(object_name.into()),
            ..Self::default()
        }
    }

    pub fn value(
        package_name: impl Into<String>,
        object_name: Option<String>,
        value_name: impl Into<String>,
    ) -> Self {
        Self {
            package_name: Some(package_name.into()),
            object_name,
            value_name: Some(value_name.into()),
            ..Self::default()
        }
    }

    pub fn primary_asset(asset_type: impl Into<String>, asset_name: impl Into<String>) -> Self {
        Self {
            primary_asset_type: Some(asset_type.into()),
            object_name: Some(asset_name.into()),
            ..Self::default()
        }
    }

    pub fn is_package(&self) -> bool {
        self.primary_asset_type.is_none()
            && self.package_name.is_some()
            && self.object_name.is_none()
            && self.value_name.is_none()
    }

    pub fn is_value(&self) -> bool {
        self.value_name.is_some()
    }

    pub fn is_primary_asset(&self) -> bool {
        self.primary_asset_type.is_some()
    }

    pub fn is_valid(&self) -> bool {
        self.primary_asset_type.is_some() || self.package_name.is_some()
    }

    pub fn package_name(&self) -> Option<&str> {
        self.package_name.as_deref()
    }
}

impl fmt::Display for AssetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(asset_type) = self.primary_asset_type.as_deref() {
            return write!(f, "{asset_type}:{}", self.object_name.as_deref().unwrap_or_default());
        }
        write!(f, "{}", self.package_name.as_deref().unwrap_or_default())?;
        if let Some(object) = self.object_name.as_deref() {
            write!(f, ".{object}")?;
        }
        if let Some(value) = self.value_name.as_deref() {
            write!(f, "::{value}")?;
        }
        Ok(())
    }
}

impl From<&str> for AssetIdentifier {
    fn from(package_name: &str) -> Self {
        Self::package(package_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_kinds_are_distinguished() {
        let package = AssetIdentifier::package("/Game/A");
        assert!(package.is_package());
        assert!(!package.is_value());

        let value = AssetIdentifier::value("/Game/A", Some("Struct".to_string()), "Field");
        assert!(value.is_value());
        assert!(!value.is_package());
        assert_eq!(value.to_string(), "/Game/A.Struct::Field");

        let primary = AssetIdentifier::primary_asset("Map", "Arena");
        assert!(primary.is_primary_asset());
        assert!(!primary.is_package());
        assert_eq!(primary.to_string(), "Map:Arena");
    }
}
