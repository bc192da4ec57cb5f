//! Builder for `sysparm_query` encoded queries.
//!
//! Clauses are `field<op>value` joined by `^` (AND) or `^OR` (OR). Values
//! may not contain `^`, which the instance would read as a separator.

use std::fmt;

/// An encoded query accumulated clause by clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedQuery {
    encoded: String,
}

impl EncodedQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a query with a `field=value` clause.
    #[must_use]
    pub fn eq(field: &str, value: &str) -> Self {
        Self::new().and_eq(field, value)
    }

    /// Appends `^field=value`.
    #[must_use]
    pub fn and_eq(self, field: &str, value: &str) -> Self {
        self.push("^", field, "=", value)
    }

    /// Appends `^ORfield=value`.
    #[must_use]
    pub fn or_eq(self, field: &str, value: &str) -> Self {
        self.push("^OR", field, "=", value)
    }

    /// Appends `^fieldENDSWITHvalue`.
    #[must_use]
    pub fn and_ends_with(self, field: &str, value: &str) -> Self {
        self.push("^", field, "ENDSWITH", value)
    }

    /// Appends `^ORfieldENDSWITHvalue`.
    #[must_use]
    pub fn or_ends_with(self, field: &str, value: &str) -> Self {
        self.push("^OR", field, "ENDSWITH", value)
    }

    /// Appends `^fieldINa,b,c`.
    #[must_use]
    pub fn and_in(self, field: &str, values: &[String]) -> Self {
        self.push("^", field, "IN", &values.join(","))
    }

    /// Appends another query's clauses with AND.
    #[must_use]
    pub fn and(mut self, other: EncodedQuery) -> Self {
        if other.is_empty() {
            return self;
        }
        if !self.encoded.is_empty() {
            self.encoded.push('^');
        }
        self.encoded.push_str(&other.encoded);
        self
    }

    /// Matches any email ending with one of `domains`.
    ///
    /// Returns an empty query for an empty list.
    #[must_use]
    pub fn email_domains(domains: &[String]) -> Self {
        domains.iter().fold(Self::new(), |query, domain| {
            query.or_ends_with("email", domain)
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    fn push(mut self, separator: &str, field: &str, op: &str, value: &str) -> Self {
        if !self.encoded.is_empty() {
            self.encoded.push_str(separator);
        }
        self.encoded.push_str(field);
        self.encoded.push_str(op);
        self.encoded.push_str(&value.replace('^', ""));
        self
    }
}

impl fmt::Display for EncodedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_assignment_filter() {
        let query = EncodedQuery::eq("role", "r1").and_eq("user", "u1");
        assert_eq!(query.as_str(), "role=r1^user=u1");
    }

    #[test]
    fn test_or_clause() {
        let query = EncodedQuery::eq("state", "1").or_eq("state", "2");
        assert_eq!(query.to_string(), "state=1^ORstate=2");
    }

    #[test]
    fn test_email_domains() {
        let domains = vec!["acme.com".to_string(), "example.org".to_string()];
        let query = EncodedQuery::email_domains(&domains);
        assert_eq!(
            query.as_str(),
            "emailENDSWITHacme.com^ORemailENDSWITHexample.org"
        );
        assert!(EncodedQuery::email_domains(&[]).is_empty());
    }

    #[test]
    fn test_in_clause() {
        let ids = vec!["s1".to_string(), "s2".to_string()];
        let query = EncodedQuery::new().and_in("variable_set", &ids);
        assert_eq!(query.as_str(), "variable_setINs1,s2");
    }

    #[test]
    fn test_and_combines_queries() {
        let query = EncodedQuery::eq("grantable", "true")
            .and(EncodedQuery::new())
            .and(EncodedQuery::eq("active", "true"));
        assert_eq!(query.as_str(), "grantable=true^active=true");
    }

    #[test]
    fn test_separator_is_stripped_from_values() {
        let query = EncodedQuery::eq("user", "u1^ORactive=false");
        assert_eq!(query.as_str(), "user=u1ORactive=false");
    }
}
