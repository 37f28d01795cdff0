use serde::{Deserialize, Serialize};
use std::fmt;

/// Lookup strategy as understood by the automation server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Id,
    AccessibilityId,
    Xpath,
    UiAutomator,
    ClassName,
}

impl Strategy {
    /// W3C `using` value.
    pub fn using(&self) -> &'static str {
        match self {
            Strategy::Id => "id",
            Strategy::AccessibilityId => "accessibility id",
            Strategy::Xpath => "xpath",
            Strategy::UiAutomator => "-android uiautomator",
            Strategy::ClassName => "class name",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "id" | "resource_id" => Some(Strategy::Id),
            "accessibility_id" | "content_desc" => Some(Strategy::AccessibilityId),
            "xpath" => Some(Strategy::Xpath),
            "uiautomator" | "android_uiautomator" | "_android_uiautomator" => {
                Some(Strategy::UiAutomator)
            }
            "class_name" | "class" => Some(Strategy::ClassName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub strategy: Strategy,
    pub value: String,
}

impl Locator {
    pub fn new(strategy: Strategy, value: impl Into<String>) -> Self {
        Self {
            strategy,
            value: value.into(),
        }
    }

    pub fn id(value: impl Into<String>) -> Self {
        Self::new(Strategy::Id, value)
    }

    pub fn accessibility(value: impl Into<String>) -> Self {
        Self::new(Strategy::AccessibilityId, value)
    }

    pub fn ui_selector_resource_id(resource_id: &str) -> Self {
        Self::new(
            Strategy::UiAutomator,
            format!("new UiSelector().resourceId(\"{}\")", escape_quotes(resource_id)),
        )
    }

    pub fn xpath_resource_id(resource_id: &str) -> Self {
        Self::new(
            Strategy::Xpath,
            format!("//*[@resource-id=\"{}\"]", escape_quotes(resource_id)),
        )
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.strategy.using(), self.value)
    }
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "\\\"")
}

/// `login` -> `com.example:id/login`; values already qualified return `None`.
pub fn package_qualified_id(package: Option<&str>, selector: &str) -> Option<String> {
    let package = package.map(str::trim).filter(|value| !value.is_empty())?;
    if selector.contains(':') {
        return None;
    }
    Some(format!("{package}:id/{selector}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_selector_strings() {
        assert_eq!(
            Locator::ui_selector_resource_id("com.x:id/ok").value,
            "new UiSelector().resourceId(\"com.x:id/ok\")"
        );
        assert_eq!(
            Locator::xpath_resource_id("ok").value,
            "//*[@resource-id=\"ok\"]"
        );
        assert_eq!(Strategy::parse("Accessibility ID"), Some(Strategy::AccessibilityId));
        assert_eq!(Strategy::parse("-android uiautomator"), Some(Strategy::UiAutomator));
    }

    #[test]
    fn qualifies_ids_only_when_needed() {
        assert_eq!(
            package_qualified_id(Some("com.example"), "login").as_deref(),
            Some("com.example:id/login")
        );
        assert_eq!(package_qualified_id(Some("com.example"), "com.example:id/login"), None);
        assert_eq!(package_qualified_id(None, "login"), None);
    }
}
