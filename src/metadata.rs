use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identity of a plugin, attached to its channel when the channel is created.
/// Read-only after construction; the broker only ever evaluates it against a
/// [`PluginFilter`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct PluginMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// File types this plugin handles, e.g. `"typescript"`. `"*"` matches any.
    #[serde(default)]
    pub file_types: Vec<String>,
    /// Named editor events this plugin wants to be woken for. `"*"` matches any.
    #[serde(default)]
    pub activation_events: Vec<String>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_file_types<I, S>(mut self, file_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_types = file_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_activation_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activation_events = events.into_iter().map(Into::into).collect();
        self
    }
}

/// Predicate a request issuer supplies to select which plugins take part in a
/// broadcast. Constructed per request, never stored. Fields are conjunctive;
/// a `None` field constrains nothing, so the default filter matches everyone.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct PluginFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_event: Option<String>,
}

impl PluginFilter {
    /// Matches every registered plugin.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_file_type(file_type: impl Into<String>) -> Self {
        Self {
            file_type: Some(file_type.into()),
            ..Default::default()
        }
    }

    pub fn for_activation_event(event: impl Into<String>) -> Self {
        Self {
            activation_event: Some(event.into()),
            ..Default::default()
        }
    }
}

/// Decides broadcast membership. Pure and total: any metadata/filter pair
/// yields a boolean, nothing panics.
pub fn matches(metadata: &PluginMetadata, filter: &PluginFilter) -> bool {
    let file_type_ok = filter
        .file_type
        .as_ref()
        .is_none_or(|wanted| metadata.file_types.iter().any(|t| t == wanted || t == "*"));

    let event_ok = filter.activation_event.as_ref().is_none_or(|wanted| {
        metadata
            .activation_events
            .iter()
            .any(|e| e == wanted || e == "*")
    });

    file_type_ok && event_ok
}
