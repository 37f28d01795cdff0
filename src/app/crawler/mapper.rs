//! Resolves oracle suggestions against the live UI.

use tracing::{debug, info};

use crate::app::error::{AppError, ERR_ELEMENT_NOT_FOUND};
use crate::app::models::{ActionKind, ActionSuggestion};
use crate::app::session::{ScrollDirection, SessionClient};
use crate::app::ui_xml::UiTree;
use crate::app::webdriver::{ElementRef, Locator, Strategy};

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedHandle {
    Element(ElementRef),
    Direction(ScrollDirection),
    None,
}

/// A suggestion bound to something executable. Click and input always carry an element.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedAction {
    pub kind: ActionKind,
    pub handle: ResolvedHandle,
    pub locator: Option<Locator>,
    pub input_text: Option<String>,
}

impl MappedAction {
    fn gesture(kind: ActionKind, handle: ResolvedHandle) -> Self {
        Self {
            kind,
            handle,
            locator: None,
            input_text: None,
        }
    }
}

fn text_xpath(label: &str) -> Option<String> {
    // XPath 1.0 has no escape for a string holding both quote kinds.
    if label.contains('"') {
        return None;
    }
    Some(format!("//*[@text=\"{label}\" or @content-desc=\"{label}\"]"))
}

fn resolve_target(
    session: &mut SessionClient,
    target: &str,
    tree: Option<&UiTree>,
) -> Result<(Locator, ElementRef), AppError> {
    let by_id = match session.find_element(target, Strategy::Id, None) {
        Ok(element) => return Ok((Locator::id(target), element)),
        Err(err) => err,
    };
    if !by_id.is(ERR_ELEMENT_NOT_FOUND) {
        return Err(by_id);
    }

    let labelled = tree.is_some_and(|tree| tree.find_by_text(target).is_some());
    let Some(xpath) = text_xpath(target).filter(|_| labelled) else {
        return Err(by_id);
    };
    debug!(trace_id = %session.trace_id(), target, "resolving target by visible label");
    let element = session.find_element(&xpath, Strategy::Xpath, None)?;
    Ok((Locator::new(Strategy::Xpath, xpath), element))
}

/// Binds `suggestion` to a live element or gesture. `tree` enables label-based lookup.
pub fn map_action(
    session: &mut SessionClient,
    suggestion: &ActionSuggestion,
    tree: Option<&UiTree>,
) -> Result<MappedAction, AppError> {
    match suggestion.action {
        ActionKind::ScrollDown => Ok(MappedAction::gesture(
            ActionKind::ScrollDown,
            ResolvedHandle::Direction(ScrollDirection::Down),
        )),
        ActionKind::ScrollUp => Ok(MappedAction::gesture(
            ActionKind::ScrollUp,
            ResolvedHandle::Direction(ScrollDirection::Up),
        )),
        ActionKind::Back => Ok(MappedAction::gesture(ActionKind::Back, ResolvedHandle::None)),
        kind @ (ActionKind::Click | ActionKind::Input) => {
            let target = suggestion
                .target_identifier
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    AppError::validation(
                        format!("{} suggestion has no target identifier", kind.as_str()),
                        session.trace_id(),
                    )
                })?;
            let (locator, element) = resolve_target(session, target, tree)?;
            info!(trace_id = %session.trace_id(), action = %kind, locator = %locator, "mapped suggestion");
            Ok(MappedAction {
                kind,
                handle: ResolvedHandle::Element(element),
                locator: Some(locator),
                input_text: match kind {
                    ActionKind::Input => Some(suggestion.input_text.clone().unwrap_or_default()),
                    _ => None,
                },
            })
        }
    }
}

pub fn execute(session: &mut SessionClient, action: &MappedAction) -> Result<(), AppError> {
    match (&action.handle, action.kind) {
        (ResolvedHandle::Element(element), ActionKind::Click) => {
            let label = action
                .locator
                .as_ref()
                .map_or_else(|| element.0.clone(), |locator| locator.value.clone());
            session.tap_resolved(&label, element)
        }
        (ResolvedHandle::Element(_), ActionKind::Input) => {
            let locator = action.locator.as_ref().ok_or_else(|| {
                AppError::validation("input action lost its locator", session.trace_id())
            })?;
            let text = action.input_text.as_deref().unwrap_or_default();
            session.send_keys(&locator.value, text, locator.strategy, true)
        }
        (ResolvedHandle::Direction(direction), _) => session.scroll(*direction),
        (ResolvedHandle::None, ActionKind::Back) => session.back(),
        (handle, kind) => Err(AppError::validation(
            format!("cannot execute {kind} with handle {handle:?}"),
            session.trace_id(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::capabilities::Capabilities;
    use crate::app::session::{AppContext, SessionTimings};
    use crate::app::ui_xml::parse_ui_tree;
    use crate::app::webdriver::fake::FakeDriver;

    fn connected(fake: &FakeDriver) -> SessionClient {
        let mut caps = Capabilities::new();
        caps.set("platformName", "Android")
            .set("automationName", "UiAutomator2")
            .set("udid", "emulator-5554");
        let mut client = SessionClient::new(
            Box::new(fake.clone()),
            SessionTimings::immediate(),
            "/nonexistent/adb",
            "trace-map",
        );
        client
            .connect(
                caps,
                "http://127.0.0.1:4723",
                AppContext::new("com.example.shop", None, Vec::new(), 3),
            )
            .expect("connect");
        client
    }

    fn suggestion(action: ActionKind, target: Option<&str>, text: Option<&str>) -> ActionSuggestion {
        ActionSuggestion {
            action,
            target_identifier: target.map(str::to_string),
            input_text: text.map(str::to_string),
            target_bounding_box: None,
            reasoning: None,
        }
    }

    #[test]
    fn gestures_map_without_lookup() {
        let fake = FakeDriver::new();
        let mut session = connected(&fake);
        let mapped = map_action(&mut session, &suggestion(ActionKind::ScrollUp, None, None), None)
            .expect("scroll");
        assert_eq!(mapped.handle, ResolvedHandle::Direction(ScrollDirection::Up));
        let mapped = map_action(&mut session, &suggestion(ActionKind::Back, None, None), None)
            .expect("back");
        assert_eq!(mapped.handle, ResolvedHandle::None);
        assert_eq!(fake.count_calls("find "), 0);
    }

    #[test]
    fn click_without_target_is_a_mapping_error() {
        let fake = FakeDriver::new();
        let mut session = connected(&fake);
        let err = map_action(&mut session, &suggestion(ActionKind::Click, Some("  "), None), None)
            .expect_err("no target");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn click_resolves_and_taps_element() {
        let fake = FakeDriver::new();
        fake.add_element(Locator::id("login"), "el-login");
        let mut session = connected(&fake);
        let mapped = map_action(&mut session, &suggestion(ActionKind::Click, Some("login"), None), None)
            .expect("mapped");
        assert_eq!(mapped.handle, ResolvedHandle::Element(ElementRef("el-login".to_string())));
        execute(&mut session, &mapped).expect("tap");
        assert!(fake.calls().contains(&"click el-login".to_string()));
    }

    #[test]
    fn visible_label_falls_back_to_text_xpath() {
        let fake = FakeDriver::new();
        fake.add_element(
            Locator::new(Strategy::Xpath, "//*[@text=\"Sign in\" or @content-desc=\"Sign in\"]"),
            "el-sign-in",
        );
        let tree = parse_ui_tree(
            r#"<hierarchy><node class="android.widget.Button" text="Sign in" /></hierarchy>"#,
        )
        .expect("tree");
        let mut session = connected(&fake);

        let without_tree = map_action(&mut session, &suggestion(ActionKind::Click, Some("Sign in"), None), None);
        assert_eq!(without_tree.expect_err("id only").code, ERR_ELEMENT_NOT_FOUND);

        let mapped = map_action(
            &mut session,
            &suggestion(ActionKind::Click, Some("Sign in"), None),
            Some(&tree),
        )
        .expect("label");
        assert_eq!(mapped.locator.map(|l| l.strategy), Some(Strategy::Xpath));
    }

    #[test]
    fn input_types_through_the_resolved_locator() {
        let fake = FakeDriver::new();
        fake.add_element(Locator::id("email"), "el-email");
        let mut session = connected(&fake);
        let mapped = map_action(
            &mut session,
            &suggestion(ActionKind::Input, Some("email"), Some("user@example.com")),
            None,
        )
        .expect("mapped");
        execute(&mut session, &mapped).expect("typed");
        assert_eq!(
            fake.state().typed,
            vec![("el-email".to_string(), "user@example.com".to_string())]
        );
    }
}
