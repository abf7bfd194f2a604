//! Command execution engine.
//!
//! Replays agent actions against the document with a human-like surface:
//! an eased pointer glide, a full synthetic press/release/click sequence
//! with native activation fallback, framework-aware value writes, and
//! robust scrolling that hunts for the page's real scroll owner. Every
//! command settles through a scoped mutation observer before its outcome
//! is computed, and at most one command is in flight at a time.
//!
//! Target resolution is forgiving by design: a stale id falls back to
//! text matching, and a miss is reported as a no-op outcome rather than
//! an error - the agent decides what to do next from the fresh blueprint.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pilot_protocol::{CommandKind, CommandPayload, ElementDescriptor, ExecutionOutcome};
use tokio::time::Instant;
use url::Url;

use crate::dom::settle::SettleObserver;
use crate::dom::{BoundingBox, Document, ElementIndex, Node, NodeId};

/// Timing and sizing knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard settle deadline after every command.
    pub settle_max: Duration,
    /// Quiet period for click-type commands.
    pub settle_quiet: Duration,
    /// Quiet period for scroll-type commands (layout settles slower).
    pub settle_quiet_scroll: Duration,
    /// Fixed pause for the `wait` command.
    pub wait_pause: Duration,
    /// How long an in-place navigation may take before a full reload.
    pub navigate_confirm: Duration,
    /// Pointer glide duration toward a target.
    pub pointer_glide: Duration,
    /// Pointer press pulse duration.
    pub pointer_press: Duration,
    /// Lifetime of highlight/spotlight visuals.
    pub highlight_ttl: Duration,
    /// Generic scroll distance as a fraction of viewport height.
    pub scroll_fraction: f64,
    /// Fallback scroll distance when a scroll_to target is missing.
    pub scroll_to_fallback_fraction: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            settle_max: Duration::from_millis(3000),
            settle_quiet: Duration::from_millis(300),
            settle_quiet_scroll: Duration::from_millis(800),
            wait_pause: Duration::from_millis(2000),
            navigate_confirm: Duration::from_millis(500),
            pointer_glide: Duration::from_millis(500),
            pointer_press: Duration::from_millis(150),
            highlight_ttl: Duration::from_millis(3000),
            scroll_fraction: 0.7,
            scroll_to_fallback_fraction: 0.5,
        }
    }
}

/// Where a command currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPhase {
    #[default]
    Idle,
    ResolvingTarget,
    Acting,
    Settling,
}

/// The visible pointer the agent moves across the page.
#[derive(Clone)]
pub struct PointerIndicator {
    inner: Arc<Mutex<PointerState>>,
}

struct PointerState {
    x: f64,
    y: f64,
    visible: bool,
}

impl PointerIndicator {
    fn new() -> Self {
        PointerIndicator {
            inner: Arc::new(Mutex::new(PointerState {
                x: 640.0,
                y: 400.0,
                visible: false,
            })),
        }
    }

    pub fn position(&self) -> (f64, f64) {
        let state = self.inner.lock();
        (state.x, state.y)
    }

    pub fn is_visible(&self) -> bool {
        self.inner.lock().visible
    }

    pub fn hide(&self) {
        self.inner.lock().visible = false;
    }

    /// Eased glide toward the target point (cubic ease-out).
    pub async fn glide_to(&self, target: (f64, f64), duration: Duration) {
        let (start_x, start_y) = {
            let mut state = self.inner.lock();
            state.visible = true;
            (state.x, state.y)
        };

        let steps = (duration.as_millis() / 16).max(1) as u32;
        for step in 1..=steps {
            let progress = step as f64 / steps as f64;
            let eased = 1.0 - (1.0 - progress).powi(3);
            {
                let mut state = self.inner.lock();
                state.x = start_x + (target.0 - start_x) * eased;
                state.y = start_y + (target.1 - start_y) * eased;
            }
            if steps > 1 {
                tokio::time::sleep(Duration::from_millis(16)).await;
            }
        }
    }

    /// Press pulse at the current position.
    pub async fn pulse(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// One active highlight box.
#[derive(Debug, Clone)]
pub struct Highlight {
    id: u64,
    pub node: NodeId,
    pub rect: BoundingBox,
}

#[derive(Default)]
struct VisualState {
    next_id: u64,
    spotlight_generation: u64,
    highlights: Vec<Highlight>,
    spotlight: bool,
}

/// Time-boxed visual decorations (highlight boxes, spotlight dim).
///
/// Purely cosmetic: visuals never affect outcome semantics and remove
/// themselves after a few seconds.
#[derive(Clone)]
pub struct VisualLayer {
    inner: Arc<Mutex<VisualState>>,
}

impl VisualLayer {
    fn new() -> Self {
        VisualLayer {
            inner: Arc::new(Mutex::new(VisualState::default())),
        }
    }

    pub fn highlights(&self) -> Vec<Highlight> {
        self.inner.lock().highlights.clone()
    }

    pub fn spotlight_active(&self) -> bool {
        self.inner.lock().spotlight
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.highlights.clear();
        state.spotlight = false;
    }

    fn add_highlight(&self, node: NodeId, rect: BoundingBox, ttl: Duration) {
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.highlights.push(Highlight { id, node, rect });
            id
        };
        if !ttl.is_zero() {
            let layer = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                layer.inner.lock().highlights.retain(|h| h.id != id);
            });
        }
    }

    fn set_spotlight(&self, ttl: Duration) {
        let generation = {
            let mut state = self.inner.lock();
            state.spotlight = true;
            state.spotlight_generation += 1;
            state.spotlight_generation
        };
        if !ttl.is_zero() {
            let layer = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let mut state = layer.inner.lock();
                if state.spotlight_generation == generation {
                    state.spotlight = false;
                }
            });
        }
    }
}

/// Executes agent commands against a [`Document`].
pub struct CommandExecutor {
    document: Arc<Document>,
    config: ExecutorConfig,
    pointer: PointerIndicator,
    visuals: VisualLayer,
    phase: CommandPhase,
}

impl CommandExecutor {
    pub fn new(document: Arc<Document>) -> Self {
        Self::with_config(document, ExecutorConfig::default())
    }

    pub fn with_config(document: Arc<Document>, config: ExecutorConfig) -> Self {
        CommandExecutor {
            document,
            config,
            pointer: PointerIndicator::new(),
            visuals: VisualLayer::new(),
            phase: CommandPhase::Idle,
        }
    }

    pub fn pointer(&self) -> &PointerIndicator {
        &self.pointer
    }

    pub fn visuals(&self) -> &VisualLayer {
        &self.visuals
    }

    pub fn phase(&self) -> CommandPhase {
        self.phase
    }

    /// Runs one command to completion: resolve, act, settle, report.
    ///
    /// Returns the structured outcome plus the fresh post-action
    /// blueprint. Never fails: unresolvable targets become logged no-ops.
    pub async fn execute(
        &mut self,
        command: &CommandPayload,
        index: &mut ElementIndex,
    ) -> (ExecutionOutcome, Vec<ElementDescriptor>) {
        let pre_url = self.document.url();
        let pre_hash = index.last_hash();

        self.phase = CommandPhase::ResolvingTarget;
        let target = match command.kind {
            CommandKind::Click | CommandKind::ScrollTo | CommandKind::Highlight => self.resolve(
                command.target_id.as_deref(),
                command.text.as_deref(),
            ),
            CommandKind::TypeText => self.resolve(command.target_id.as_deref(), None),
            _ => None,
        };

        self.phase = CommandPhase::Acting;
        let acting_started = Instant::now();
        self.act(command, target).await;

        self.phase = CommandPhase::Settling;
        let quiet = match command.kind {
            CommandKind::Scroll | CommandKind::ScrollTo => self.config.settle_quiet_scroll,
            _ => self.config.settle_quiet,
        };
        let observer = SettleObserver::observe(&self.document);
        observer.settle(self.config.settle_max, quiet).await;
        let settle_time_ms = acting_started.elapsed().as_millis() as u64;

        let fresh = index.scan(true).unwrap_or_default();
        let outcome = ExecutionOutcome {
            dom_changed: pre_hash != index.last_hash(),
            url_changed: self.document.url() != pre_url,
            new_elements_count: fresh.iter().filter(|e| e.is_new).count(),
            current_url: self.document.url_str(),
            has_modal: self.document.detect_modal(),
            settle_time_ms,
            dom_hash: index.last_hash().unwrap_or(0),
            scroll_y: self.document.scroll_y().round() as i32,
        };

        self.phase = CommandPhase::Idle;
        (outcome, fresh)
    }

    async fn act(&self, command: &CommandPayload, target: Option<NodeId>) {
        match command.kind {
            CommandKind::Wait => {
                tracing::debug!("Holding for page-side work");
                tokio::time::sleep(self.config.wait_pause).await;
            }
            CommandKind::Click => {
                let Some(node) = target else {
                    self.log_miss(command);
                    return;
                };
                self.pointer
                    .glide_to(self.center_of(node), self.config.pointer_glide)
                    .await;
                self.pointer.pulse(self.config.pointer_press).await;

                self.document.dispatch_click_sequence(node);
                self.document.activate(node);
                let tag = self.document.tag_of(node);
                if tag == "input" || tag == "textarea" {
                    self.document.focus(node);
                }
            }
            CommandKind::TypeText => {
                let Some(node) = target else {
                    self.log_miss(command);
                    return;
                };
                let Some(text) = command.text.as_deref() else {
                    tracing::warn!("type_text without text payload");
                    return;
                };
                self.pointer
                    .glide_to(self.center_of(node), self.config.pointer_glide)
                    .await;
                self.document.focus(node);
                self.document.set_value(node, text);
            }
            CommandKind::ScrollTo => match target {
                Some(node) => {
                    self.document.scroll_into_view(node);
                    let rect = self.rect_of(node);
                    self.visuals
                        .add_highlight(node, rect, self.config.highlight_ttl);
                }
                None => {
                    let (_, vh) = self.document.viewport();
                    self.robust_scroll(1.0, Some(vh * self.config.scroll_to_fallback_fraction));
                }
            },
            CommandKind::Scroll => {
                let direction = match command.text.as_deref() {
                    Some(text) if text.contains("up") => -1.0,
                    _ => 1.0,
                };
                self.robust_scroll(direction, None);
            }
            CommandKind::Highlight => {
                let Some(node) = target else {
                    self.log_miss(command);
                    return;
                };
                let rect = self.rect_of(node);
                self.visuals
                    .add_highlight(node, rect, self.config.highlight_ttl);
            }
            CommandKind::Spotlight => {
                self.visuals.set_spotlight(self.config.highlight_ttl);
            }
            CommandKind::Clear => {
                self.visuals.clear();
            }
            CommandKind::Navigate => {
                let destination = command
                    .text
                    .as_deref()
                    .or(command.target_id.as_deref());
                match destination {
                    Some(url) => self.navigate(url).await,
                    None => tracing::warn!("navigate command without a destination"),
                }
            }
        }
    }

    /// Same-origin targets navigate in place and fall back to a full
    /// reload when the URL fails to change within the confirm window;
    /// cross-origin targets always reload.
    pub async fn navigate(&self, raw: &str) {
        let current = self.document.url();
        let resolved = match Url::parse(raw).or_else(|_| current.join(raw)) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Unusable navigation target '{}': {}", raw, e);
                return;
            }
        };

        if resolved.origin() == current.origin() {
            tracing::debug!(url = %resolved, "In-place history navigation");
            self.document.push_history(resolved.clone());
            tokio::time::sleep(self.config.navigate_confirm).await;
            if self.document.url() != resolved {
                tracing::warn!("Router rejected in-place navigation, reloading");
                self.document.reload(resolved);
            }
        } else {
            tracing::debug!(url = %resolved, "Cross-origin navigation, full reload");
            self.document.reload(resolved);
        }
    }

    fn log_miss(&self, command: &CommandPayload) {
        tracing::warn!(
            "No element matched target '{}' for {:?}; reporting no-op",
            command.target_id.as_deref().unwrap_or(""),
            command.kind
        );
    }

    fn center_of(&self, node: NodeId) -> (f64, f64) {
        let rect = self.rect_of(node);
        (rect.x + rect.width / 2.0, rect.y + rect.height / 2.0)
    }

    fn rect_of(&self, node: NodeId) -> BoundingBox {
        self.document.read().node(node).rect
    }

    /// Scrolls the viewport plus any plausible scroll containers; when the
    /// page's primary scroll owner is not the root, a fallback search
    /// finds the real scroller.
    fn robust_scroll(&self, direction: f64, amount: Option<f64>) {
        let (_, vh) = self.document.viewport();
        let dy = amount.unwrap_or(vh * self.config.scroll_fraction) * direction;

        self.document.scroll_by(dy);

        let (containers, ad_hoc) = {
            let inner = self.document.read();
            let mut containers = Vec::new();
            let mut ad_hoc = None;
            inner.visit(inner.root, &mut |id, node: &Node| {
                let overflowing = node.scroll_height > node.client_height;
                if !overflowing {
                    return;
                }
                if is_scroll_container(node) {
                    containers.push(id);
                } else if node.style.scrollable && ad_hoc.is_none() {
                    ad_hoc = Some(id);
                }
            });
            (containers, ad_hoc)
        };

        if containers.is_empty() {
            if let Some(node) = ad_hoc {
                tracing::debug!(node, "Scrolling ad-hoc overflow container");
                self.document.scroll_node_by(node, dy);
            }
        } else {
            for node in containers {
                self.document.scroll_node_by(node, dy);
            }
        }
    }

    /// Target resolution ladder: natural id/name, cached automation id,
    /// test id, fuzzy text, then target-id-as-text.
    fn resolve(&self, target_id: Option<&str>, fallback_text: Option<&str>) -> Option<NodeId> {
        let target_id = target_id?;
        let inner = self.document.read();
        let root = inner.root;

        if let Some(node) = inner.find(root, &|_, n: &Node| {
            n.attrs.get("id").map(String::as_str) == Some(target_id)
                || n.attrs.get("name").map(String::as_str) == Some(target_id)
        }) {
            return Some(node);
        }

        if let Some(node) = inner.find(root, &|_, n: &Node| {
            n.automation_id.as_deref() == Some(target_id)
        }) {
            return Some(node);
        }

        if let Some(node) = inner.find(root, &|_, n: &Node| {
            n.attrs.get("data-testid").map(String::as_str) == Some(target_id)
        }) {
            return Some(node);
        }

        if let Some(needle) = fallback_text {
            let needle = needle.trim().to_lowercase();
            if !needle.is_empty() {
                tracing::warn!(
                    "Target '{}' not found, trying fallback text '{}'",
                    target_id,
                    needle
                );
                let found = inner.find(root, &|id, n: &Node| {
                    if !is_text_match_candidate(n) {
                        return false;
                    }
                    let text = inner.visible_text(id).trim().to_lowercase();
                    text == needle || (needle.len() > 5 && text.contains(&needle))
                });
                if found.is_some() {
                    return found;
                }
            }
        }

        // Last resort: the id itself as element text.
        let id_lower = target_id.to_lowercase();
        inner.find(root, &|id, n: &Node| {
            is_interactive_tag(n) && inner.visible_text(id).to_lowercase().contains(&id_lower)
        })
    }
}

fn is_scroll_container(node: &Node) -> bool {
    let class = node.attrs.get("class").map(String::as_str).unwrap_or("");
    node.tag == "main"
        || node.tag == "section"
        || node.attrs.get("id").map(String::as_str) == Some("content")
        || node.attrs.get("role").map(String::as_str) == Some("main")
        || class.contains("content")
        || class.contains("overflow-y-auto")
        || class.contains("overflow-auto")
}

fn is_text_match_candidate(node: &Node) -> bool {
    matches!(
        node.tag.as_str(),
        "button" | "a" | "h1" | "h2" | "h3" | "h4" | "span" | "div"
    ) || node.attrs.get("role").map(String::as_str) == Some("button")
}

fn is_interactive_tag(node: &Node) -> bool {
    matches!(node.tag.as_str(), "button" | "a")
        || node.attrs.get("role").map(String::as_str) == Some("button")
}
