//! Declarative operator metadata for introspection and flow editors.
//!
//! Every operator registered in a DAG carries a [`ViewMetadata`] record
//! describing its label, category, configurable parameters, and typed input
//! and output ports. The record is a plain serializable value; it never
//! executes code. Flow editors read it to render configuration forms, and
//! [`ViewMetadata::resolve_params`] validates user-supplied values against
//! the declared schema at build time.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Category an operator belongs to, used for grouping in editors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCategory {
    Common,
    Llm,
    Rag,
    Conversation,
    Trigger,
    Output,
}

impl Default for OperatorCategory {
    fn default() -> Self {
        OperatorCategory::Common
    }
}

/// Schema entry for one configurable operator parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterMeta {
    /// Unique key within the operator.
    pub key: String,
    /// Declared value type tag (`"str"`, `"int"`, `"float"`, `"bool"`).
    pub type_tag: String,
    /// Default used when the parameter is absent.
    #[serde(default)]
    pub default: Option<Value>,
    /// Whether the parameter may be omitted.
    #[serde(default)]
    pub optional: bool,
    /// Hint for editors (`"text"`, `"select"`, `"slider"`, ...).
    #[serde(default)]
    pub ui_hint: Option<String>,
    /// Closed set of accepted values, when applicable.
    #[serde(default)]
    pub options: Vec<Value>,
}

/// One typed input or output port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IOField {
    pub key: String,
    /// Human-readable type name of the payload.
    pub type_name: String,
    /// Whether the port carries a list of the declared type.
    #[serde(default)]
    pub is_list: bool,
    #[serde(default)]
    pub description: String,
}

impl IOField {
    pub fn new(key: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            type_name: type_name.into(),
            is_list: false,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn list(mut self) -> Self {
        self.is_list = true;
        self
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Introspectable description of an operator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewMetadata {
    pub label: String,
    pub name: String,
    #[serde(default)]
    pub category: OperatorCategory,
    #[serde(default)]
    pub parameters: Vec<ParameterMeta>,
    #[serde(default)]
    pub inputs: Vec<IOField>,
    #[serde(default)]
    pub outputs: Vec<IOField>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Errors raised while resolving parameter values against the schema.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unknown parameter key: {key}")]
    UnknownKey { key: String },

    #[error("missing required parameter: {key}")]
    MissingRequired { key: String },
}

impl ViewMetadata {
    /// Start a builder with the given label and unique name.
    pub fn builder(label: impl Into<String>, name: impl Into<String>) -> ViewMetadataBuilder {
        ViewMetadataBuilder {
            meta: ViewMetadata {
                label: label.into(),
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Resolve user-supplied parameter values against the declared schema.
    ///
    /// Unknown keys are rejected; missing non-optional parameters without a
    /// default are errors; declared defaults fill the gaps.
    pub fn resolve_params(
        &self,
        supplied: &FxHashMap<String, Value>,
    ) -> Result<FxHashMap<String, Value>, MetadataError> {
        for key in supplied.keys() {
            if !self.parameters.iter().any(|p| &p.key == key) {
                return Err(MetadataError::UnknownKey { key: key.clone() });
            }
        }

        let mut resolved = FxHashMap::default();
        for param in &self.parameters {
            match supplied.get(&param.key) {
                Some(value) => {
                    resolved.insert(param.key.clone(), value.clone());
                }
                None => match (&param.default, param.optional) {
                    (Some(default), _) => {
                        resolved.insert(param.key.clone(), default.clone());
                    }
                    (None, true) => {}
                    (None, false) => {
                        return Err(MetadataError::MissingRequired {
                            key: param.key.clone(),
                        });
                    }
                },
            }
        }
        Ok(resolved)
    }
}

/// Fluent builder for [`ViewMetadata`].
pub struct ViewMetadataBuilder {
    meta: ViewMetadata,
}

impl ViewMetadataBuilder {
    #[must_use]
    pub fn category(mut self, category: OperatorCategory) -> Self {
        self.meta.category = category;
        self
    }

    #[must_use]
    pub fn parameter(mut self, parameter: ParameterMeta) -> Self {
        self.meta.parameters.push(parameter);
        self
    }

    #[must_use]
    pub fn input(mut self, field: IOField) -> Self {
        self.meta.inputs.push(field);
        self
    }

    #[must_use]
    pub fn output(mut self, field: IOField) -> Self {
        self.meta.outputs.push(field);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tags.push(tag.into());
        self
    }

    pub fn build(self) -> ViewMetadata {
        self.meta
    }
}
