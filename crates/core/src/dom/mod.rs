//! In-memory document model.
//!
//! The engine observes and drives a page through this model: an arena tree
//! of elements with attributes, computed-style flags, geometry, shadow
//! subtrees and embedded frames. Hosts bridge it to a real renderer; tests
//! build pages directly with [`NodeSpec`].
//!
//! Two broadcast channels make the document observable:
//!
//! - [`Mutation`]s fire on every structural/attribute/text change and feed
//!   settle detection ([`crate::dom::settle`]).
//! - [`PageEvent`]s are the synthetic input events the executor dispatches
//!   (pointer sequences, value changes, navigation). Hosts react to them
//!   the way page scripts react to real input.

mod index;
pub mod settle;

pub use index::{ElementIndex, IndexConfig, content_hash, djb2};

use std::collections::HashMap;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use url::Url;

/// Index of a node in the document arena.
pub type NodeId = usize;

/// What kind of change a [`Mutation`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Children added or removed.
    Subtree,
    /// An attribute or form value changed.
    Attributes,
    /// Text content changed.
    Text,
}

/// One observed document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub node: NodeId,
}

/// Synthetic input dispatched by the executor, observable by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    PointerDown(NodeId),
    PointerUp(NodeId),
    Click(NodeId),
    /// Native activation fallback after the pointer sequence.
    Activated(NodeId),
    Focus(NodeId),
    Input { node: NodeId, value: String },
    Change { node: NodeId, value: String },
    /// In-place history navigation plus router notification.
    LocationChanged { url: String },
    /// Full-page navigation.
    Reload { url: String },
    Scrolled { y: f64 },
}

/// Computed-style flags the scanner cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Style {
    pub display_none: bool,
    pub visibility_hidden: bool,
    pub opacity_zero: bool,
    pub cursor_pointer: bool,
    /// overflow-y auto/scroll.
    pub scrollable: bool,
}

impl Style {
    /// Whether the element is rendered at all.
    pub fn visible(&self) -> bool {
        !self.display_none && !self.visibility_hidden && !self.opacity_zero
    }
}

/// Document-absolute element geometry, in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Embedded frame content attached to an `iframe` node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameContent {
    /// Cross-origin frames exist in the tree but are never traversed.
    pub same_origin: bool,
    pub body: NodeId,
}

/// One element in the arena.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    /// Direct text content of this node (not descendants).
    pub text: Option<String>,
    /// Current form value, for inputs.
    pub value: Option<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub shadow_root: Option<NodeId>,
    pub frame: Option<FrameContent>,
    pub style: Style,
    pub rect: BoundingBox,
    pub disabled: bool,
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
    /// Detached marker; detached nodes are skipped by traversal.
    pub detached: bool,
    /// Cached stable id, assigned on first scan and kept for the page's
    /// lifetime.
    pub automation_id: Option<String>,
}

impl Node {
    fn from_spec(spec: NodeSpec, parent: Option<NodeId>) -> Self {
        Node {
            tag: spec.tag,
            attrs: spec.attrs,
            text: spec.text,
            value: spec.value,
            parent,
            children: Vec::new(),
            shadow_root: None,
            frame: None,
            style: spec.style,
            rect: spec.rect,
            disabled: spec.disabled,
            scroll_top: 0.0,
            scroll_height: spec.scroll_height,
            client_height: spec.client_height,
            detached: false,
            automation_id: None,
        }
    }
}

/// Builder for inserting elements into a [`Document`].
#[derive(Debug, Clone)]
pub struct NodeSpec {
    tag: String,
    attrs: HashMap<String, String>,
    text: Option<String>,
    value: Option<String>,
    style: Style,
    rect: BoundingBox,
    disabled: bool,
    scroll_height: f64,
    client_height: f64,
}

impl NodeSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        NodeSpec {
            tag: tag.into(),
            attrs: HashMap::new(),
            text: None,
            value: None,
            style: Style::default(),
            rect: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 100.0,
                height: 20.0,
            },
            disabled: false,
            scroll_height: 0.0,
            client_height: 0.0,
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn rect(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.rect = BoundingBox {
            x,
            y,
            width,
            height,
        };
        self
    }

    pub fn pointer_cursor(mut self) -> Self {
        self.style.cursor_pointer = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.style.display_none = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Marks the element as an overflow scroller with the given heights.
    pub fn scrollable(mut self, scroll_height: f64, client_height: f64) -> Self {
        self.style.scrollable = true;
        self.scroll_height = scroll_height;
        self.client_height = client_height;
        self
    }
}

pub(crate) struct DocumentInner {
    pub nodes: Vec<Node>,
    pub root: NodeId,
    pub url: Url,
    pub viewport: (f64, f64),
    pub scroll_x: f64,
    pub scroll_y: f64,
    /// Total scrollable height of the page.
    pub content_height: f64,
    pub active_element: Option<NodeId>,
}

impl DocumentInner {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Concatenated text of the node and its rendered descendants.
    pub fn visible_text(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        if node.detached || !node.style.visible() {
            return;
        }
        // Vector-graphics subtrees carry no rendered text; their <title>
        // is surfaced separately by the scanner's icon fallback.
        if node.tag == "svg" {
            return;
        }
        if let Some(text) = &node.text {
            if !out.is_empty() && !text.is_empty() {
                out.push(' ');
            }
            out.push_str(text);
        }
        for &child in &node.children {
            self.collect_text(child, out);
        }
    }

    /// First descendant (including self) matching the predicate, honoring
    /// shadow subtrees and same-origin frames.
    pub fn find<F>(&self, from: NodeId, predicate: &F) -> Option<NodeId>
    where
        F: Fn(NodeId, &Node) -> bool,
    {
        let node = &self.nodes[from];
        if node.detached {
            return None;
        }
        if predicate(from, node) {
            return Some(from);
        }
        for &child in &node.children {
            if let Some(found) = self.find(child, predicate) {
                return Some(found);
            }
        }
        if let Some(shadow) = node.shadow_root {
            if let Some(found) = self.find(shadow, predicate) {
                return Some(found);
            }
        }
        if let Some(frame) = node.frame {
            if frame.same_origin {
                if let Some(found) = self.find(frame.body, predicate) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Visits every reachable node in tree order.
    pub fn visit<F>(&self, from: NodeId, visitor: &mut F)
    where
        F: FnMut(NodeId, &Node),
    {
        let node = &self.nodes[from];
        if node.detached {
            return;
        }
        visitor(from, node);
        for &child in &node.children {
            self.visit(child, visitor);
        }
        if let Some(shadow) = node.shadow_root {
            self.visit(shadow, visitor);
        }
        if let Some(frame) = node.frame {
            if frame.same_origin {
                self.visit(frame.body, visitor);
            }
        }
    }

    /// Position of `id` among its parent's children, for path hashing.
    pub fn sibling_index(&self, id: NodeId) -> usize {
        match self.nodes[id].parent {
            Some(parent) => self.nodes[parent]
                .children
                .iter()
                .position(|&c| c == id)
                .unwrap_or(0),
            None => 0,
        }
    }
}

/// The live page the engine observes and drives.
///
/// Cheap to share: wrap in `Arc` and hand clones to the index, executor
/// and host.
pub struct Document {
    inner: RwLock<DocumentInner>,
    mutations: broadcast::Sender<Mutation>,
    events: broadcast::Sender<PageEvent>,
}

impl Document {
    /// Creates a document with an empty `body` root at the given URL.
    pub fn new(url: Url) -> Self {
        let root = Node::from_spec(NodeSpec::new("body").rect(0.0, 0.0, 1280.0, 0.0), None);
        let (mutations, _) = broadcast::channel(256);
        let (events, _) = broadcast::channel(64);
        Document {
            inner: RwLock::new(DocumentInner {
                nodes: vec![root],
                root: 0,
                url,
                viewport: (1280.0, 800.0),
                scroll_x: 0.0,
                scroll_y: 0.0,
                content_height: 800.0,
                active_element: None,
            }),
            mutations,
            events,
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, DocumentInner> {
        self.inner.read()
    }

    fn write(&self) -> RwLockWriteGuard<'_, DocumentInner> {
        self.inner.write()
    }

    fn emit_mutation(&self, kind: MutationKind, node: NodeId) {
        let _ = self.mutations.send(Mutation { kind, node });
    }

    fn emit_event(&self, event: PageEvent) {
        let _ = self.events.send(event);
    }

    /// Subscribes to document mutations.
    pub fn subscribe_mutations(&self) -> broadcast::Receiver<Mutation> {
        self.mutations.subscribe()
    }

    /// Subscribes to synthetic input events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }

    // --- construction / host-side mutation ---

    pub fn root(&self) -> NodeId {
        self.read().root
    }

    /// Appends an element under `parent`.
    pub fn append(&self, parent: NodeId, spec: NodeSpec) -> NodeId {
        let id = {
            let mut inner = self.write();
            let id = inner.nodes.len();
            inner.nodes.push(Node::from_spec(spec, Some(parent)));
            inner.nodes[parent].children.push(id);
            id
        };
        self.emit_mutation(MutationKind::Subtree, parent);
        id
    }

    /// Attaches a shadow root to `host` and returns it.
    pub fn attach_shadow(&self, host: NodeId) -> NodeId {
        let id = {
            let mut inner = self.write();
            let id = inner.nodes.len();
            inner
                .nodes
                .push(Node::from_spec(NodeSpec::new("#shadow-root"), Some(host)));
            inner.nodes[host].shadow_root = Some(id);
            id
        };
        self.emit_mutation(MutationKind::Subtree, host);
        id
    }

    /// Appends an `iframe` with an embedded document body.
    ///
    /// Returns `(frame, body)`; content appended under `body` is reachable
    /// by the scanner only when `same_origin` is true.
    pub fn append_frame(
        &self,
        parent: NodeId,
        spec: NodeSpec,
        same_origin: bool,
    ) -> (NodeId, NodeId) {
        let (frame_id, body_id) = {
            let mut inner = self.write();
            let frame_id = inner.nodes.len();
            let mut frame_node = Node::from_spec(spec, Some(parent));
            frame_node.tag = "iframe".into();
            inner.nodes.push(frame_node);
            inner.nodes[parent].children.push(frame_id);

            let body_id = inner.nodes.len();
            inner
                .nodes
                .push(Node::from_spec(NodeSpec::new("body"), Some(frame_id)));
            inner.nodes[frame_id].frame = Some(FrameContent {
                same_origin,
                body: body_id,
            });
            (frame_id, body_id)
        };
        self.emit_mutation(MutationKind::Subtree, parent);
        (frame_id, body_id)
    }

    /// Detaches a node (and its subtree) from the document.
    pub fn remove(&self, id: NodeId) {
        let parent = {
            let mut inner = self.write();
            inner.nodes[id].detached = true;
            let parent = inner.nodes[id].parent;
            if let Some(parent) = parent {
                inner.nodes[parent].children.retain(|&c| c != id);
            }
            parent
        };
        self.emit_mutation(MutationKind::Subtree, parent.unwrap_or(id));
    }

    pub fn set_text(&self, id: NodeId, text: impl Into<String>) {
        self.write().nodes[id].text = Some(text.into());
        self.emit_mutation(MutationKind::Text, id);
    }

    pub fn set_attr(&self, id: NodeId, name: impl Into<String>, value: impl Into<String>) {
        self.write().nodes[id].attrs.insert(name.into(), value.into());
        self.emit_mutation(MutationKind::Attributes, id);
    }

    pub fn set_rect(&self, id: NodeId, x: f64, y: f64, width: f64, height: f64) {
        self.write().nodes[id].rect = BoundingBox {
            x,
            y,
            width,
            height,
        };
    }

    pub fn set_viewport(&self, width: f64, height: f64) {
        let mut inner = self.write();
        inner.viewport = (width, height);
    }

    pub fn set_content_height(&self, height: f64) {
        self.write().content_height = height;
    }

    // --- read access ---

    pub fn url(&self) -> Url {
        self.read().url.clone()
    }

    pub fn url_str(&self) -> String {
        self.read().url.to_string()
    }

    pub fn viewport(&self) -> (f64, f64) {
        self.read().viewport
    }

    pub fn scroll_y(&self) -> f64 {
        self.read().scroll_y
    }

    pub fn active_element(&self) -> Option<NodeId> {
        self.read().active_element
    }

    pub fn value_of(&self, id: NodeId) -> Option<String> {
        self.read().nodes[id].value.clone()
    }

    pub fn tag_of(&self, id: NodeId) -> String {
        self.read().nodes[id].tag.clone()
    }

    pub fn attr_of(&self, id: NodeId, name: &str) -> Option<String> {
        self.read().nodes[id].attrs.get(name).cloned()
    }

    /// Whether a dialog/modal marker is currently present.
    pub fn detect_modal(&self) -> bool {
        let inner = self.read();
        inner
            .find(inner.root, &|_, node: &Node| {
                if !node.style.visible() {
                    return false;
                }
                let role = node.attrs.get("role").map(String::as_str);
                let class = node.attrs.get("class").map(String::as_str).unwrap_or("");
                (node.tag == "dialog" && node.attrs.contains_key("open"))
                    || matches!(role, Some("dialog") | Some("alertdialog"))
                    || node.attrs.get("aria-modal").map(String::as_str) == Some("true")
                    || (class.contains("modal")
                        && (class.contains("show") || class.contains("active")))
            })
            .is_some()
    }

    // --- synthetic input (executor-side) ---

    /// Moves focus to the node.
    pub fn focus(&self, id: NodeId) {
        self.write().active_element = Some(id);
        self.emit_event(PageEvent::Focus(id));
    }

    /// Dispatches the full pointer press/release/click sequence.
    pub fn dispatch_click_sequence(&self, id: NodeId) {
        self.emit_event(PageEvent::PointerDown(id));
        self.emit_event(PageEvent::PointerUp(id));
        self.emit_event(PageEvent::Click(id));
    }

    /// Native activation fallback (the element's own click behavior).
    pub fn activate(&self, id: NodeId) {
        self.emit_event(PageEvent::Activated(id));
    }

    /// Writes a form value through the native setter and notifies
    /// listeners, bypassing any property override a reactive UI layer may
    /// have installed.
    pub fn set_value(&self, id: NodeId, value: impl Into<String>) {
        let value = value.into();
        self.write().nodes[id].value = Some(value.clone());
        self.emit_mutation(MutationKind::Attributes, id);
        self.emit_event(PageEvent::Input {
            node: id,
            value: value.clone(),
        });
        self.emit_event(PageEvent::Change { node: id, value });
    }

    /// Scrolls the root viewport by `dy`, clamped to the content height.
    pub fn scroll_by(&self, dy: f64) {
        let y = {
            let mut inner = self.write();
            let max = (inner.content_height - inner.viewport.1).max(0.0);
            inner.scroll_y = (inner.scroll_y + dy).clamp(0.0, max);
            inner.scroll_y
        };
        self.emit_event(PageEvent::Scrolled { y });
    }

    /// Scrolls an overflow container by `dy`.
    pub fn scroll_node_by(&self, id: NodeId, dy: f64) {
        let mut inner = self.write();
        let node = &mut inner.nodes[id];
        let max = (node.scroll_height - node.client_height).max(0.0);
        node.scroll_top = (node.scroll_top + dy).clamp(0.0, max);
    }

    /// Scrolls so the node is vertically centered in the viewport.
    pub fn scroll_into_view(&self, id: NodeId) {
        let y = {
            let mut inner = self.write();
            let rect = inner.nodes[id].rect;
            let (_, vh) = inner.viewport;
            let target = rect.y + rect.height / 2.0 - vh / 2.0;
            let max = (inner.content_height - vh).max(0.0);
            inner.scroll_y = target.clamp(0.0, max);
            inner.scroll_y
        };
        self.emit_event(PageEvent::Scrolled { y });
    }

    /// In-place history navigation: updates the URL and notifies the
    /// host's router without reloading.
    pub fn push_history(&self, url: Url) {
        self.write().url = url.clone();
        self.emit_event(PageEvent::LocationChanged {
            url: url.to_string(),
        });
    }

    /// Hosts call this when a client-side router rejects an in-place
    /// navigation and restores the previous location.
    pub fn revert_url(&self, url: Url) {
        self.write().url = url;
    }

    /// Full-page navigation.
    pub fn reload(&self, url: Url) {
        {
            let mut inner = self.write();
            inner.url = url.clone();
            inner.scroll_y = 0.0;
            inner.active_element = None;
        }
        self.emit_event(PageEvent::Reload {
            url: url.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::new(Url::parse("https://app.example.com/").unwrap())
    }

    #[test]
    fn append_and_visible_text() {
        let doc = doc();
        let root = doc.root();
        let card = doc.append(root, NodeSpec::new("div"));
        doc.append(card, NodeSpec::new("span").text("Total"));
        doc.append(card, NodeSpec::new("span").text("42"));
        let hidden = doc.append(card, NodeSpec::new("span").hidden());
        doc.set_text(hidden, "invisible");

        let inner = doc.read();
        assert_eq!(inner.visible_text(card), "Total 42");
    }

    #[test]
    fn mutations_are_broadcast() {
        let doc = doc();
        let mut rx = doc.subscribe_mutations();
        let root = doc.root();
        let node = doc.append(root, NodeSpec::new("div"));
        doc.set_text(node, "hello");

        assert_eq!(
            rx.try_recv().unwrap(),
            Mutation {
                kind: MutationKind::Subtree,
                node: root
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Mutation {
                kind: MutationKind::Text,
                node
            }
        );
    }

    #[test]
    fn click_sequence_emits_events_in_order() {
        let doc = doc();
        let mut rx = doc.subscribe_events();
        let button = doc.append(doc.root(), NodeSpec::new("button").text("Go"));

        doc.dispatch_click_sequence(button);
        doc.activate(button);

        assert_eq!(rx.try_recv().unwrap(), PageEvent::PointerDown(button));
        assert_eq!(rx.try_recv().unwrap(), PageEvent::PointerUp(button));
        assert_eq!(rx.try_recv().unwrap(), PageEvent::Click(button));
        assert_eq!(rx.try_recv().unwrap(), PageEvent::Activated(button));
    }

    #[test]
    fn set_value_notifies_input_and_change() {
        let doc = doc();
        let mut rx = doc.subscribe_events();
        let input = doc.append(doc.root(), NodeSpec::new("input"));

        doc.set_value(input, "hello");
        assert_eq!(doc.value_of(input).as_deref(), Some("hello"));
        assert_eq!(
            rx.try_recv().unwrap(),
            PageEvent::Input {
                node: input,
                value: "hello".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PageEvent::Change {
                node: input,
                value: "hello".into()
            }
        );
    }

    #[test]
    fn scroll_clamps_to_content() {
        let doc = doc();
        doc.set_viewport(1280.0, 800.0);
        doc.set_content_height(2000.0);

        doc.scroll_by(560.0);
        assert_eq!(doc.scroll_y(), 560.0);
        doc.scroll_by(10_000.0);
        assert_eq!(doc.scroll_y(), 1200.0);
        doc.scroll_by(-10_000.0);
        assert_eq!(doc.scroll_y(), 0.0);
    }

    #[test]
    fn cross_origin_frame_content_is_unreachable() {
        let doc = doc();
        let root = doc.root();
        let (_, same_body) =
            doc.append_frame(root, NodeSpec::new("iframe"), true);
        let (_, cross_body) =
            doc.append_frame(root, NodeSpec::new("iframe"), false);
        doc.append(same_body, NodeSpec::new("button").text("inside"));
        doc.append(cross_body, NodeSpec::new("button").text("blocked"));

        let inner = doc.read();
        let mut tags = Vec::new();
        inner.visit(inner.root, &mut |_, node| tags.push(node.text.clone()));
        let texts: Vec<_> = tags.into_iter().flatten().collect();
        assert!(texts.contains(&"inside".to_string()));
        assert!(!texts.contains(&"blocked".to_string()));
    }

    #[test]
    fn modal_detection_markers() {
        let doc = doc();
        assert!(!doc.detect_modal());
        let dialog = doc.append(doc.root(), NodeSpec::new("div").attr("role", "dialog"));
        assert!(doc.detect_modal());
        doc.remove(dialog);
        assert!(!doc.detect_modal());

        doc.append(
            doc.root(),
            NodeSpec::new("div").attr("class", "modal show"),
        );
        assert!(doc.detect_modal());
    }
}
