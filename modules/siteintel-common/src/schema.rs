use serde::{Deserialize, Serialize};

/// How a disagreement between an existing resolved value and a new observation
/// of the same field is settled.
///
/// Empty observations never displace a non-empty value, whatever the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    /// Differing non-empty values open a pending conflict for a human.
    #[default]
    Manual,
    /// The first non-empty value stands. Later differing values are recorded
    /// as an automatic resolution in favour of the existing one.
    PreferNonEmpty,
    /// The most recent non-empty observation wins, including a value that
    /// an earlier automatic resolution replaced.
    PreferRecent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaField {
    pub name: String,
    #[serde(default)]
    pub rule: ResolutionRule,
}

/// The fixed set of logical fields a complete company profile should carry.
/// Field coverage is measured against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSchema {
    pub fields: Vec<SchemaField>,
}

impl TargetSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Rule for a field. Fields outside the schema are settled manually.
    pub fn rule_for(&self, name: &str) -> ResolutionRule {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.rule)
            .unwrap_or_default()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

impl Default for TargetSchema {
    fn default() -> Self {
        use ResolutionRule::*;
        let fields = [
            ("company_name", PreferNonEmpty),
            ("description", PreferRecent),
            ("industry", Manual),
            ("headquarters", Manual),
            ("founded_year", Manual),
            ("employee_count", Manual),
            ("products", PreferNonEmpty),
            ("services", PreferNonEmpty),
            ("leadership", Manual),
            ("contact_email", PreferNonEmpty),
            ("contact_phone", PreferNonEmpty),
            ("social_links", PreferRecent),
            ("pricing", PreferRecent),
            ("customers", PreferNonEmpty),
            ("technologies", PreferRecent),
        ];
        Self {
            fields: fields
                .into_iter()
                .map(|(name, rule)| SchemaField {
                    name: name.to_string(),
                    rule,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_default_to_manual() {
        let schema = TargetSchema::default();
        assert_eq!(schema.rule_for("favourite_colour"), ResolutionRule::Manual);
        assert_eq!(schema.rule_for("description"), ResolutionRule::PreferRecent);
        assert!(schema.contains("employee_count"));
    }

    #[test]
    fn rule_defaults_when_omitted_in_config() {
        let field: SchemaField = serde_json::from_str(r#"{"name": "industry"}"#).unwrap();
        assert_eq!(field.rule, ResolutionRule::Manual);
    }
}
