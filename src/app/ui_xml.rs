//! Typed access to UIAutomator page-source snapshots.
//!
//! The scanner is a forgiving byte walker: comments, processing instructions and text
//! content are skipped, and unbalanced closing tags are ignored. Attribute values are
//! kept exactly as they appear in the source so a re-rendered tree stays valid XML.

use std::fmt::Write;

const ALWAYS_ALLOWED_PACKAGE: &str = "com.android.systemui";
const TRUNCATION_MARKER: &str = "... (truncated)";

const ORACLE_ATTRIBUTES: &[&str] = &[
    "class",
    "resource-id",
    "text",
    "content-desc",
    "hint",
    "clickable",
    "focusable",
    "enabled",
    "checkable",
    "checked",
    "selected",
    "editable",
    "long-clickable",
    "password",
    "bounds",
];

const BOOLEAN_ATTRIBUTES: &[&str] = &[
    "clickable",
    "focusable",
    "enabled",
    "checkable",
    "checked",
    "selected",
    "editable",
    "long-clickable",
    "password",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Bounds {
    pub fn center(&self) -> (i64, i64) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }
}

/// `[x1,y1][x2,y2]` as written by UIAutomator.
pub fn parse_bounds(value: &str) -> Option<Bounds> {
    let numbers: Vec<i64> = value
        .split(|ch: char| ch == '[' || ch == ']' || ch == ',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    match numbers.as_slice() {
        [left, top, right, bottom] => Some(Bounds {
            left: *left,
            top: *top,
            right: *right,
            bottom: *bottom,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiNode {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<UiNode>,
}

impl UiNode {
    fn new(tag: &str, attrs: Vec<(String, String)>) -> Self {
        Self {
            tag: tag.to_string(),
            attrs,
            children: Vec::new(),
        }
    }

    /// Raw attribute value as it appears in the source.
    pub fn attr(&self, name: &str) -> Option<&str> {
        find_attr(&self.attrs, name)
    }

    fn attr_text(&self, name: &str) -> Option<String> {
        self.attr(name)
            .filter(|value| !value.is_empty())
            .map(unescape_xml)
    }

    fn flag(&self, name: &str) -> bool {
        self.attr(name) == Some("true")
    }

    pub fn class(&self) -> Option<&str> {
        self.attr("class").filter(|value| !value.is_empty())
    }

    pub fn package(&self) -> Option<&str> {
        self.attr("package").filter(|value| !value.is_empty())
    }

    pub fn resource_id(&self) -> Option<String> {
        self.attr_text("resource-id")
    }

    pub fn text(&self) -> Option<String> {
        self.attr_text("text")
    }

    pub fn content_desc(&self) -> Option<String> {
        self.attr_text("content-desc")
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.attr("bounds").and_then(parse_bounds)
    }

    pub fn clickable(&self) -> bool {
        self.flag("clickable")
    }

    pub fn enabled(&self) -> bool {
        self.flag("enabled")
    }

    /// Pre-order walk over this node and its descendants.
    pub fn descendants(&self) -> Vec<&UiNode> {
        let mut out = Vec::new();
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            out.push(node);
            pending.extend(node.children.iter().rev());
        }
        out
    }

    fn write_xml(&self, out: &mut String, keep: &dyn Fn(&str, &str) -> bool) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attrs {
            if keep(name, value) {
                let _ = write!(out, " {name}=\"{value}\"");
            }
        }
        if self.children.is_empty() {
            out.push_str(" />");
            return;
        }
        out.push('>');
        for child in &self.children {
            child.write_xml(out, keep);
        }
        let _ = write!(out, "</{}>", self.tag);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiTree {
    pub roots: Vec<UiNode>,
}

impl UiTree {
    pub fn nodes(&self) -> impl Iterator<Item = &UiNode> {
        self.roots.iter().flat_map(UiNode::descendants)
    }

    /// Matches the full id (`pkg:id/name`) or just its `name` part.
    pub fn find_by_resource_id(&self, id: &str) -> Option<&UiNode> {
        self.nodes().find(|node| {
            node.resource_id().is_some_and(|value| {
                value == id || value.rsplit_once(":id/").is_some_and(|(_, name)| name == id)
            })
        })
    }

    pub fn find_by_text(&self, text: &str) -> Option<&UiNode> {
        self.nodes().find(|node| {
            node.text().as_deref() == Some(text) || node.content_desc().as_deref() == Some(text)
        })
    }

    pub fn to_xml(&self) -> String {
        self.render(&|_, _| true)
    }

    fn render(&self, keep: &dyn Fn(&str, &str) -> bool) -> String {
        let mut out = String::new();
        for root in &self.roots {
            root.write_xml(&mut out, keep);
        }
        out
    }
}

fn find_attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(attr_name, _)| attr_name == name)
        .map(|(_, value)| value.as_str())
}

fn unescape_xml(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

enum Token<'a> {
    Open {
        tag: &'a str,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close,
}

fn skip_until(bytes: &[u8], mut index: usize, terminator: &[u8]) -> usize {
    while index + terminator.len() <= bytes.len() && &bytes[index..index + terminator.len()] != terminator {
        index += 1;
    }
    (index + terminator.len()).min(bytes.len())
}

fn skip_whitespace(bytes: &[u8], mut index: usize) -> usize {
    while index < bytes.len() && bytes[index].is_ascii_whitespace() {
        index += 1;
    }
    index
}

/// Reads one element start tag beginning just after `<`. Returns the token and the
/// index just past the closing `>`.
fn read_open_tag(xml: &str, start: usize) -> Result<(Token<'_>, usize), String> {
    let bytes = xml.as_bytes();
    let mut cursor = start;
    while cursor < bytes.len() {
        let ch = bytes[cursor];
        if ch == b'/' || ch == b'>' || ch.is_ascii_whitespace() {
            break;
        }
        cursor += 1;
    }
    if cursor == start {
        return Err("Malformed XML tag".into());
    }
    let tag = &xml[start..cursor];
    let mut attrs = Vec::new();
    let mut self_closing = false;

    loop {
        cursor = skip_whitespace(bytes, cursor);
        if cursor >= bytes.len() {
            return Err(format!("Unterminated tag <{tag}>"));
        }
        match bytes[cursor] {
            b'>' => {
                cursor += 1;
                break;
            }
            b'/' => {
                self_closing = true;
                cursor += 1;
                if cursor < bytes.len() && bytes[cursor] == b'>' {
                    cursor += 1;
                }
                break;
            }
            _ => {}
        }

        let name_start = cursor;
        while cursor < bytes.len() && bytes[cursor] != b'=' && !bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        let name_end = cursor;
        cursor = skip_whitespace(bytes, cursor);
        if cursor >= bytes.len() || bytes[cursor] != b'=' {
            return Err("Malformed attribute assignment".into());
        }
        cursor = skip_whitespace(bytes, cursor + 1);
        if cursor >= bytes.len() {
            return Err("Missing attribute value".into());
        }
        let quote = bytes[cursor];
        if quote != b'"' && quote != b'\'' {
            return Err("Attribute value must be quoted".into());
        }
        cursor += 1;
        let value_start = cursor;
        while cursor < bytes.len() && bytes[cursor] != quote {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            return Err("Unterminated attribute value".into());
        }
        attrs.push((
            xml[name_start..name_end].to_string(),
            xml[value_start..cursor].to_string(),
        ));
        cursor += 1;
    }

    Ok((
        Token::Open {
            tag,
            attrs,
            self_closing,
        },
        cursor,
    ))
}

fn next_token(xml: &str, mut index: usize) -> Result<Option<(Token<'_>, usize)>, String> {
    let bytes = xml.as_bytes();
    while index < bytes.len() {
        if bytes[index] != b'<' {
            index += 1;
            continue;
        }
        if index + 1 >= bytes.len() {
            break;
        }
        match bytes[index + 1] {
            b'/' => return Ok(Some((Token::Close, skip_until(bytes, index + 2, b">")))),
            b'!' if bytes[index..].starts_with(b"<!--") => index = skip_until(bytes, index + 4, b"-->"),
            b'!' => index = skip_until(bytes, index + 2, b">"),
            b'?' => index = skip_until(bytes, index + 2, b"?>"),
            _ => return read_open_tag(xml, index + 1).map(Some),
        }
    }
    Ok(None)
}

pub fn parse_ui_tree(xml: &str) -> Result<UiTree, String> {
    let mut roots = Vec::new();
    let mut stack: Vec<UiNode> = Vec::new();
    let mut index = 0;

    while let Some((token, next)) = next_token(xml, index)? {
        index = next;
        match token {
            Token::Open {
                tag,
                attrs,
                self_closing,
            } => {
                let node = UiNode::new(tag, attrs);
                if self_closing {
                    attach(&mut stack, &mut roots, node);
                } else {
                    stack.push(node);
                }
            }
            Token::Close => {
                if let Some(node) = stack.pop() {
                    attach(&mut stack, &mut roots, node);
                }
            }
        }
    }

    while let Some(node) = stack.pop() {
        attach(&mut stack, &mut roots, node);
    }
    Ok(UiTree { roots })
}

fn attach(stack: &mut [UiNode], roots: &mut Vec<UiNode>, node: UiNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

fn truncate(mut text: String, max_len: usize) -> String {
    if text.len() <= max_len {
        return text;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    text
}

/// Reduced snapshot sent to the oracle: only layout-relevant attributes, with
/// `false` boolean flags dropped, truncated to `max_len` bytes.
pub fn simplify_for_oracle(xml: &str, max_len: usize) -> Result<String, String> {
    if xml.trim().is_empty() {
        return Ok(String::new());
    }
    let tree = parse_ui_tree(xml)?;
    let simplified = tree.render(&|name, value| {
        ORACLE_ATTRIBUTES.contains(&name)
            && !(BOOLEAN_ATTRIBUTES.contains(&name) && value == "false")
            && !value.is_empty()
    });
    Ok(truncate(simplified, max_len))
}

fn retain_allowed(node: &mut UiNode, allowed: &dyn Fn(&str) -> bool) {
    node.children.retain(|child| child.package().map_or(true, allowed));
    for child in &mut node.children {
        retain_allowed(child, allowed);
    }
}

/// Drops node subtrees whose `package` attribute is outside the allowed set.
pub fn filter_by_allowed_packages(xml: &str, packages: &[String]) -> Result<String, String> {
    let mut tree = parse_ui_tree(xml)?;
    let allowed = |package: &str| {
        package == ALWAYS_ALLOWED_PACKAGE || packages.iter().any(|value| value == package)
    };
    tree.roots
        .retain(|root| root.package().map_or(true, allowed));
    for root in &mut tree.roots {
        retain_allowed(root, &allowed);
    }
    Ok(tree.to_xml())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <!-- status bar -->
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.android.systemui" clickable="false" bounds="[0,0][1080,80]" />
  <node index="1" text="" resource-id="com.example.shop:id/root" class="android.widget.LinearLayout" package="com.example.shop" clickable="false" enabled="true" bounds="[0,80][1080,2400]">
    <node index="0" text="Sign in" resource-id="com.example.shop:id/login" class="android.widget.Button" package="com.example.shop" content-desc="" clickable="true" enabled="true" checked="false" bounds="[100,900][980,1000]" />
    <node index="1" text="Terms &amp; Conditions" resource-id="" class="android.widget.TextView" package="com.example.shop" content-desc="terms" clickable="false" bounds="[100,1100][980,1160]" />
  </node>
  <node index="2" text="Ad" class="android.widget.TextView" package="com.ads.sdk" bounds="[0,2300][1080,2400]" />
</hierarchy>"#;

    #[test]
    fn parses_nested_hierarchy() {
        let tree = parse_ui_tree(SAMPLE).expect("parse");
        assert_eq!(tree.roots.len(), 1);
        let hierarchy = &tree.roots[0];
        assert_eq!(hierarchy.tag, "hierarchy");
        assert_eq!(hierarchy.children.len(), 3);
        assert_eq!(hierarchy.children[1].children.len(), 2);
        assert_eq!(tree.nodes().count(), 6);
    }

    #[test]
    fn declarations_end_at_their_own_bracket() {
        let xml = r#"<?xml version="1.0"?><!DOCTYPE hierarchy><!-- dumped <node/> --><hierarchy><node text="a" /><!-- x --><node text="b" /></hierarchy>"#;
        let tree = parse_ui_tree(xml).expect("parse");
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].children.len(), 2);
        assert!(tree.find_by_text("b").is_some());
    }

    #[test]
    fn finds_nodes_by_id_and_text() {
        let tree = parse_ui_tree(SAMPLE).expect("parse");
        let login = tree.find_by_resource_id("login").expect("short id");
        assert_eq!(login.text().as_deref(), Some("Sign in"));
        assert!(login.clickable());
        assert_eq!(login.bounds().map(|b| b.center()), Some((540, 950)));
        assert!(tree.find_by_resource_id("com.example.shop:id/login").is_some());

        let terms = tree.find_by_text("Terms & Conditions").expect("unescaped text");
        assert_eq!(terms.content_desc().as_deref(), Some("terms"));
        assert!(tree.find_by_text("terms").is_some());
        assert!(tree.find_by_text("missing").is_none());
    }

    #[test]
    fn parses_bounds_strings() {
        assert_eq!(
            parse_bounds("[0,80][1080,2400]"),
            Some(Bounds {
                left: 0,
                top: 80,
                right: 1080,
                bottom: 2400
            })
        );
        assert_eq!(parse_bounds("[1,2]"), None);
        assert_eq!(parse_bounds("garbage"), None);
    }

    #[test]
    fn simplified_snapshot_keeps_only_layout_attributes() {
        let simplified = simplify_for_oracle(SAMPLE, 100_000).expect("simplify");
        assert!(!simplified.contains("index="));
        assert!(!simplified.contains("package="));
        assert!(!simplified.contains("clickable=\"false\""));
        assert!(!simplified.contains("checked="));
        assert!(simplified.contains("clickable=\"true\""));
        assert!(simplified.contains("resource-id=\"com.example.shop:id/login\""));
        assert!(simplified.contains("text=\"Terms &amp; Conditions\""));
        assert!(!simplified.contains("<!--"));
    }

    #[test]
    fn simplified_snapshot_is_truncated() {
        let simplified = simplify_for_oracle(SAMPLE, 40).expect("simplify");
        assert!(simplified.ends_with(TRUNCATION_MARKER));
        assert_eq!(simplified.len(), 40 + TRUNCATION_MARKER.len());
        assert_eq!(simplify_for_oracle("  ", 40).expect("empty"), "");
    }

    #[test]
    fn filters_foreign_package_subtrees() {
        let filtered =
            filter_by_allowed_packages(SAMPLE, &["com.example.shop".to_string()]).expect("filter");
        assert!(!filtered.contains("com.ads.sdk"));
        assert!(filtered.contains("com.android.systemui"));
        assert!(filtered.contains("com.example.shop:id/login"));
    }

    #[test]
    fn rejects_unquoted_attributes() {
        let err = parse_ui_tree("<node text=hello />").expect_err("unquoted");
        assert!(err.contains("quoted"));
    }

    #[test]
    fn tolerates_unbalanced_tags() {
        let tree = parse_ui_tree("</stray><a><b text=\"x\"></a>").expect("parse");
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.nodes().count(), 2);
    }
}
