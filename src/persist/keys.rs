use crate::core::{Result, StoreError};
use crate::expression::escape_glob;

/// Prefix of the dimension segment in index keys. Entity ids may not start
/// with it, which keeps index keys disjoint from primary keys.
pub const INDEX_TAG: char = '#';

const ORDER_SEGMENT: &str = "order";

/// Key naming for one aggregate scope:
///
/// - primary record: `{namespace}:{scope}:{realm}:{id}`
/// - index set:      `{namespace}:{scope}:{realm}:#{dimension}:{value}`
/// - order index:    `{namespace}:{scope}:order`
///
/// The dimension segment of index keys carries an [`INDEX_TAG`] prefix
/// (`r1:#user:u1` rather than `r1:user:u1`). Entity ids may not start with
/// it, so no primary key of a realm can collide with one of its index sets
/// and `{realm}:#*` selects the index sets alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
    scope: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>, scope: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let scope = scope.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("scope", &scope)?;
        Ok(Self { namespace, scope })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn primary_key(&self, realm_id: &str, id: &str) -> Result<String> {
        validate_segment("realm id", realm_id)?;
        validate_entity_id(id)?;
        Ok(format!("{}:{}:{}:{}", self.namespace, self.scope, realm_id, id))
    }

    pub fn index_key(&self, realm_id: &str, dimension: &str, value: &str) -> Result<String> {
        validate_segment("realm id", realm_id)?;
        validate_segment("index dimension", dimension)?;
        Ok(format!(
            "{}:{}:{}:{}{}:{}",
            self.namespace, self.scope, realm_id, INDEX_TAG, dimension, value
        ))
    }

    pub fn order_key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.scope, ORDER_SEGMENT)
    }

    /// Member stored in the scope-wide order index for one record.
    pub fn order_member(&self, realm_id: &str, id: &str) -> String {
        format!("{}:{}", realm_id, id)
    }

    /// Inverse of [`KeySpace::order_member`].
    pub fn parse_order_member<'a>(&self, member: &'a str) -> Option<(&'a str, &'a str)> {
        member.split_once(':')
    }

    /// Glob matching every key of the scope, order index included.
    pub fn scope_pattern(&self) -> String {
        format!(
            "{}:{}:*",
            escape_glob(&self.namespace),
            escape_glob(&self.scope)
        )
    }

    /// Glob matching every primary record and index set of one realm.
    pub fn realm_pattern(&self, realm_id: &str) -> String {
        format!(
            "{}:{}:{}:*",
            escape_glob(&self.namespace),
            escape_glob(&self.scope),
            escape_glob(realm_id)
        )
    }

    /// Glob matching only the index sets of one realm.
    pub fn realm_index_pattern(&self, realm_id: &str) -> String {
        format!(
            "{}:{}:{}:{}*",
            escape_glob(&self.namespace),
            escape_glob(&self.scope),
            escape_glob(realm_id),
            INDEX_TAG
        )
    }

    /// Split an index key into `(realm, dimension, value)`; `None` for
    /// primary and order keys and for keys of other scopes.
    pub fn parse_index<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
        let rest = key
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix(':')?
            .strip_prefix(self.scope.as_str())?
            .strip_prefix(':')?;
        let (realm_id, rest) = rest.split_once(':')?;
        let (dimension, value) = rest.strip_prefix(INDEX_TAG)?.split_once(':')?;
        if realm_id.is_empty() || dimension.is_empty() {
            return None;
        }
        Some((realm_id, dimension, value))
    }

    /// Split a primary key into `(realm, id)`; `None` for index and order
    /// keys and for keys of other scopes.
    pub fn parse_primary<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = key
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix(':')?
            .strip_prefix(self.scope.as_str())?
            .strip_prefix(':')?;
        let (realm_id, id) = rest.split_once(':')?;
        if realm_id.is_empty() || id.is_empty() || id.starts_with(INDEX_TAG) {
            return None;
        }
        Some((realm_id, id))
    }
}

fn validate_segment(what: &str, segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(StoreError::InvalidKey(format!("{} must not be empty", what)));
    }
    if segment.contains(':') {
        return Err(StoreError::InvalidKey(format!(
            "{} '{}' must not contain ':'",
            what, segment
        )));
    }
    Ok(())
}

fn validate_entity_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidKey("entity id must not be empty".into()));
    }
    if id.starts_with(INDEX_TAG) {
        return Err(StoreError::InvalidKey(format!(
            "entity id '{}' must not start with '{}'",
            id, INDEX_TAG
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::glob_match;

    fn keyspace() -> KeySpace {
        KeySpace::new("kc", "sessions").unwrap()
    }

    #[test]
    fn test_key_layout() {
        let ks = keyspace();
        assert_eq!(ks.primary_key("r1", "s1").unwrap(), "kc:sessions:r1:s1");
        assert_eq!(ks.index_key("r1", "user", "u1").unwrap(), "kc:sessions:r1:#user:u1");
        assert_eq!(ks.order_key(), "kc:sessions:order");
    }

    #[test]
    fn test_parse_primary_skips_index_and_order_keys() {
        let ks = keyspace();
        assert_eq!(ks.parse_primary("kc:sessions:r1:s1"), Some(("r1", "s1")));
        assert_eq!(ks.parse_primary("kc:sessions:r1:a:b"), Some(("r1", "a:b")));
        assert_eq!(ks.parse_primary("kc:sessions:r1:#user:u1"), None);
        assert_eq!(ks.parse_primary("kc:sessions:order"), None);
        assert_eq!(ks.parse_primary("kc:other:r1:s1"), None);
    }

    #[test]
    fn test_parse_index_round_trips_index_keys() {
        let ks = keyspace();
        let key = ks.index_key("r1", "broker-user", "idp:u1").unwrap();
        assert_eq!(ks.parse_index(&key), Some(("r1", "broker-user", "idp:u1")));
        assert_eq!(ks.parse_index("kc:sessions:r1:s1"), None);
        assert_eq!(ks.parse_index("kc:sessions:order"), None);
        assert_eq!(ks.parse_index("kc:other:r1:#user:u1"), None);
    }

    #[test]
    fn test_rejects_ambiguous_segments() {
        let ks = keyspace();
        assert!(ks.primary_key("r:1", "s1").is_err());
        assert!(ks.primary_key("r1", "#s1").is_err());
        assert!(ks.primary_key("r1", "").is_err());
        assert!(KeySpace::new("kc:x", "sessions").is_err());
    }

    #[test]
    fn test_patterns_cover_the_right_keys() {
        let ks = keyspace();
        let realm = ks.realm_pattern("r1");
        assert!(glob_match("kc:sessions:r1:s1", &realm).unwrap());
        assert!(glob_match("kc:sessions:r1:#user:u1", &realm).unwrap());
        assert!(!glob_match("kc:sessions:r10:s1", &realm).unwrap());
        assert!(!glob_match("kc:sessions:order", &realm).unwrap());

        let index = ks.realm_index_pattern("r1");
        assert!(glob_match("kc:sessions:r1:#user:u1", &index).unwrap());
        assert!(!glob_match("kc:sessions:r1:s1", &index).unwrap());

        assert!(glob_match("kc:sessions:order", &ks.scope_pattern()).unwrap());
    }

    #[test]
    fn test_order_member_round_trip() {
        let ks = keyspace();
        let member = ks.order_member("r1", "a:b");
        assert_eq!(ks.parse_order_member(&member), Some(("r1", "a:b")));
    }
}
