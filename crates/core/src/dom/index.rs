//! Page blueprint scanner and differ.
//!
//! [`ElementIndex::scan`] walks the reachable document - piercing shadow
//! subtrees and same-origin frames - and distills it into a bounded,
//! ordered list of [`ElementDescriptor`]s the agent can reason about.
//! Every kept element gets a stable id so the agent can target it across
//! scans; a content hash over the kept set makes the scan differential:
//! unchanged pages produce no update at all.

use std::collections::HashSet;
use std::sync::Arc;

use pilot_protocol::{ElementDescriptor, Rect};
use regex::Regex;

use super::{Document, DocumentInner, Node, NodeId};

/// Vector-graphics primitives, never useful for interaction.
const SVG_NOISE_TAGS: &[&str] = &[
    "svg", "path", "rect", "circle", "line", "polyline", "polygon", "ellipse", "use", "defs",
    "clippath", "g", "mask", "symbol", "lineargradient", "radialgradient", "stop", "pattern",
    "marker", "filter", "fegaussianblur", "feoffset", "feblend", "fecolormatrix", "tspan",
];

const CONTEXT_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "label", "th", "td", "nav", "legend", "p", "li", "dt",
    "dd",
];

const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];

const CLICKABLE_ROLES: &[&str] = &[
    "button", "link", "menuitem", "tab", "checkbox", "switch", "option",
];

/// Tuning knobs for the scanner.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Hard cap on elements per blueprint.
    pub max_elements: usize,
    /// How far past the viewport edge (px) elements are still kept.
    pub viewport_margin: f64,
    /// Extracted-text length cap, in characters.
    pub text_cap: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            max_elements: 400,
            viewport_margin: 100.0,
            text_cap: 80,
        }
    }
}

/// Scans a [`Document`] into diffable blueprints.
pub struct ElementIndex {
    document: Arc<Document>,
    config: IndexConfig,
    metric_class: Regex,
    last_hash: Option<u32>,
    previous_ids: Option<HashSet<String>>,
}

impl ElementIndex {
    pub fn new(document: Arc<Document>) -> Self {
        Self::with_config(document, IndexConfig::default())
    }

    pub fn with_config(document: Arc<Document>, config: IndexConfig) -> Self {
        ElementIndex {
            document,
            config,
            // Class hints for numeric/metric content ("data blindness" guard).
            metric_class: Regex::new("(?i)value|price|stat|count|total|metric|amount")
                .expect("static pattern"),
            last_hash: None,
            previous_ids: None,
        }
    }

    /// Hash of the most recent kept set.
    pub fn last_hash(&self) -> Option<u32> {
        self.last_hash
    }

    /// Scans the document.
    ///
    /// Returns `None` when `force` is false and the content hash matches
    /// the previous scan, letting callers skip redundant sends.
    /// `force = true` always returns the current list and re-baselines.
    pub fn scan(&mut self, force: bool) -> Option<Vec<ElementDescriptor>> {
        let document = Arc::clone(&self.document);
        let mut elements = Vec::new();
        let mut current_ids: HashSet<String> = HashSet::new();
        let mut new_cached_ids: Vec<(NodeId, String)> = Vec::new();

        {
            let inner = document.read();
            let root = inner.root;
            inner.visit(root, &mut |id, node| {
                if let Some(descriptor) =
                    self.consider(&inner, id, node, &mut current_ids, &mut new_cached_ids)
                {
                    elements.push(descriptor);
                }
            });
        }

        // Persist freshly computed stable ids on the nodes so later scans
        // and the executor reuse them.
        if !new_cached_ids.is_empty() {
            document.cache_stable_ids(&new_cached_ids);
        }

        let hash = content_hash(&elements);
        if !force && self.last_hash == Some(hash) {
            return None;
        }
        self.last_hash = Some(hash);
        self.previous_ids = Some(current_ids);

        // New elements first, then interactive, then context. The sort is
        // stable so document order breaks ties.
        elements.sort_by(|a, b| {
            b.is_new
                .cmp(&a.is_new)
                .then(b.interactive.cmp(&a.interactive))
        });
        elements.truncate(self.config.max_elements);

        Some(elements)
    }

    fn consider(
        &self,
        inner: &DocumentInner,
        id: NodeId,
        node: &Node,
        current_ids: &mut HashSet<String>,
        new_cached_ids: &mut Vec<(NodeId, String)>,
    ) -> Option<ElementDescriptor> {
        let tag = node.tag.as_str();
        if SVG_NOISE_TAGS.contains(&tag) {
            return None;
        }

        let input_type = node.attrs.get("type").map(String::as_str);
        if node.disabled || matches!(input_type, Some("hidden") | Some("password")) {
            return None;
        }
        if !node.style.visible() {
            return None;
        }

        let interactive = is_interactive(node);
        let class = node.attrs.get("class").map(String::as_str).unwrap_or("");
        let full_text = inner.visible_text(id);
        let context = CONTEXT_TAGS.contains(&tag)
            || self.metric_class.is_match(class)
            || (node.children.is_empty()
                && full_text.len() > 2
                && full_text.len() < 200);
        if !interactive && !context {
            return None;
        }

        // Only elements within or near the viewport, with non-trivial size.
        let (vw, vh) = inner.viewport;
        let margin = self.config.viewport_margin;
        let rect = node.rect;
        let top = rect.y - inner.scroll_y;
        let left = rect.x - inner.scroll_x;
        let in_viewport = top < vh + margin
            && top + rect.height > -margin
            && left < vw
            && left + rect.width > 0.0;
        if !in_viewport || rect.width < 2.0 || rect.height < 2.0 {
            return None;
        }

        let stable_id = match natural_id(node) {
            Some(natural) => natural,
            None => match &node.automation_id {
                Some(cached) => cached.clone(),
                None => {
                    let computed = stable_hash_id(inner, id, node);
                    new_cached_ids.push((id, computed.clone()));
                    computed
                }
            },
        };

        // Duplicate ids across nested scans collapse to the first hit.
        if !current_ids.insert(stable_id.clone()) {
            return None;
        }

        let is_new = self
            .previous_ids
            .as_ref()
            .is_some_and(|prev| !prev.contains(&stable_id));

        let reported_tag = if HEADING_TAGS.contains(&tag) {
            "header".to_string()
        } else {
            tag.to_string()
        };

        let state = if inner.active_element == Some(id) {
            "focused".to_string()
        } else if class.contains("active") || class.contains("selected") {
            "active".to_string()
        } else {
            String::new()
        };

        Some(ElementDescriptor {
            id: stable_id,
            text: self.extract_text(inner, id, node),
            tag: reported_tag,
            interactive,
            is_new,
            state,
            aria_selected: node.attrs.get("aria-selected").cloned(),
            aria_current: node.attrs.get("aria-current").cloned(),
            aria_expanded: node.attrs.get("aria-expanded").cloned(),
            rect: Rect {
                x: rect.x.round() as i32,
                y: rect.y.round() as i32,
                width: rect.width.round() as i32,
                height: rect.height.round() as i32,
            },
        })
    }

    /// Best-available text with the accessibility-first priority chain.
    fn extract_text(&self, inner: &DocumentInner, id: NodeId, node: &Node) -> String {
        for attr in ["aria-label", "title", "placeholder"] {
            if let Some(value) = node.attrs.get(attr) {
                let cleaned = clean_text(value, self.config.text_cap);
                if !cleaned.is_empty() {
                    return cleaned;
                }
            }
        }

        let visible = clean_text(&inner.visible_text(id), self.config.text_cap);
        if !visible.is_empty() {
            return visible;
        }

        if let Some(value) = &node.value {
            let cleaned = clean_text(value, self.config.text_cap);
            if !cleaned.is_empty() {
                return cleaned;
            }
        }

        // Icon-only elements: descendant image alt, then vector title.
        if let Some(img) = inner.find(id, &|_, n: &Node| {
            n.tag == "img" && n.attrs.get("alt").is_some_and(|alt| !alt.is_empty())
        }) {
            if let Some(alt) = inner.node(img).attrs.get("alt") {
                return clean_text(alt, self.config.text_cap);
            }
        }
        if let Some(svg) = inner.find(id, &|_, n: &Node| n.tag == "svg") {
            if let Some(title) = inner.find(svg, &|_, n: &Node| n.tag == "title") {
                if let Some(text) = &inner.node(title).text {
                    return clean_text(text, self.config.text_cap);
                }
            }
        }

        String::new()
    }
}

impl Document {
    /// Stores computed stable ids on their nodes without emitting
    /// mutations (ids are scanner bookkeeping, not document changes).
    pub(crate) fn cache_stable_ids(&self, assignments: &[(NodeId, String)]) {
        let mut inner = self.inner.write();
        for (id, stable) in assignments {
            inner.nodes[*id].automation_id = Some(stable.clone());
        }
    }
}

fn is_interactive(node: &Node) -> bool {
    if node.disabled {
        return false;
    }
    let tag = node.tag.as_str();
    let focusable = matches!(tag, "button" | "input" | "select" | "textarea")
        || (tag == "a" && node.attrs.contains_key("href"))
        || node.attrs.get("contenteditable").map(String::as_str) == Some("true")
        || node
            .attrs
            .get("tabindex")
            .and_then(|t| t.parse::<i32>().ok())
            .is_some_and(|t| t >= 0);
    let clickable_role = node
        .attrs
        .get("role")
        .is_some_and(|role| CLICKABLE_ROLES.contains(&role.as_str()));
    focusable || clickable_role || node.style.cursor_pointer
}

fn natural_id(node: &Node) -> Option<String> {
    node.attrs
        .get("id")
        .or_else(|| node.attrs.get("name"))
        .filter(|value| !value.is_empty())
        .cloned()
}

/// Deterministic stable id: DJB2 hash of tag, trimmed text, role, link
/// target, input type and the positional path among siblings, rendered as
/// `t-<base36>`.
fn stable_hash_id(inner: &DocumentInner, id: NodeId, node: &Node) -> String {
    let text: String = inner.visible_text(id).trim().chars().take(30).collect();
    let role = node.attrs.get("role").map(String::as_str).unwrap_or("");
    let href = node.attrs.get("href").map(String::as_str).unwrap_or("");
    let input_type = node.attrs.get("type").map(String::as_str).unwrap_or("");

    let mut path_segments = Vec::new();
    let mut cursor = Some(id);
    while let Some(current) = cursor {
        let parent = inner.node(current).parent;
        if parent.is_some() {
            path_segments.push(inner.sibling_index(current).to_string());
        }
        cursor = parent;
    }
    path_segments.reverse();
    let path = path_segments.join(".");

    let key = format!("{}|{}|{}|{}|{}|{}", node.tag, text, role, href, input_type, path);
    format!("t-{}", to_base36(djb2(&key)))
}

/// DJB2-xor hash, unsigned 32-bit.
pub fn djb2(input: &str) -> u32 {
    let mut hash: u32 = 5381;
    for c in input.chars() {
        hash = hash.wrapping_shl(5).wrapping_add(hash) ^ (c as u32);
    }
    hash
}

/// Change hash over the kept set: id, text and position per element.
pub fn content_hash(elements: &[ElementDescriptor]) -> u32 {
    let mut composite = String::new();
    for element in elements {
        composite.push_str(&element.id);
        composite.push(':');
        composite.push_str(&element.text);
        composite.push(':');
        composite.push_str(&element.rect.x.to_string());
        composite.push(':');
        composite.push_str(&element.rect.y.to_string());
        composite.push('|');
    }
    djb2(&composite)
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

fn clean_text(input: &str, cap: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(cap).collect()
}
