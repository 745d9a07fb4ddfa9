use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use nanoid::nanoid;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::debug;

use crate::driver::{BrowserDriver, PageInspector};
use crate::error::DriverError;
use crate::model::{normalize_role, ElementState, InteractiveElement, PageSnapshot};
use crate::selector::{Descriptor, TEST_ATTRIBUTES};

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: (1280, 800) }
    }
}

/// [`BrowserDriver`] over a single Chromium page.
pub struct ChromiumDriver {
    page: Page,
    _browser: OxideBrowser,
}

impl ChromiumDriver {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // fresh profile per launch
        let profile_dir = std::env::temp_dir().join(format!("glass-pilot-profile-{}", nanoid!(10)));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let driver = Self { page, _browser: browser };
        driver.fix_viewport(cfg.viewport).await?;
        Ok(driver)
    }

    /// Attaches to a running Chromium through its DevTools websocket.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        Ok(Self { page, _browser: browser })
    }

    async fn fix_viewport(&self, (width, height): (u32, u32)) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    async fn eval<T: DeserializeOwned>(&self, js: String) -> Result<T, DriverError> {
        self.page
            .evaluate(js)
            .await
            .map_err(script_err)?
            .into_value::<T>()
            .map_err(script_err)
    }

    /// Runs `body` with `el` bound to the descriptor's first match.
    /// Fails with `Stale` when nothing matches any more.
    async fn on_element<T: DeserializeOwned>(&self, target: &Descriptor, body: &str) -> Result<T, DriverError> {
        let reply: ScriptReply<T> = self.eval(element_script(target, body)?).await?;
        match reply {
            ScriptReply { error: Some(e), .. } => Err(DriverError::Script(e)),
            ScriptReply { found: false, .. } => Err(DriverError::Stale(target.to_string())),
            ScriptReply { value: Some(v), .. } => Ok(v),
            ScriptReply { value: None, .. } => Err(DriverError::Script(format!("no result for {}", target))),
        }
    }

    async fn mouse_click(&self, at: Point) -> Result<(), DriverError> {
        let cmd = DispatchMouseEventParams::builder()
            .x(at.x)
            .y(at.y)
            .button(MouseButton::Left)
            .click_count(1);
        let pressed = cmd.clone().r#type(DispatchMouseEventType::MousePressed).build().map_err(other)?;
        let released = cmd.r#type(DispatchMouseEventType::MouseReleased).build().map_err(other)?;
        self.page
            .move_mouse(at)
            .await
            .map_err(other)?
            .execute(pressed)
            .await
            .map_err(other)?;
        self.page.execute(released).await.map_err(other)?;
        Ok(())
    }

    async fn key_event(&self, kind: DispatchKeyEventType, key: &str) -> Result<(), DriverError> {
        let mut cmd = DispatchKeyEventParams::builder().r#type(kind.clone()).key(key).code(key);
        if key == "Enter" {
            cmd = cmd.windows_virtual_key_code(13).native_virtual_key_code(13);
            if kind == DispatchKeyEventType::KeyDown {
                cmd = cmd.text("\r");
            }
        }
        self.page.execute(cmd.build().map_err(other)?).await.map_err(other)?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ScriptReply<T> {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    error: Option<String>,
    value: Option<T>,
}

#[derive(Deserialize)]
struct Center {
    x: f64,
    y: f64,
}

/// Raw element facts reported by [`PROBE_JS`] and [`SNAPSHOT_JS`].
#[derive(Debug, Default, Deserialize)]
struct RawElement {
    tag: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    visible: bool,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    value: Option<String>,
}

impl RawElement {
    fn into_state(self) -> ElementState {
        let tag = self.tag.to_lowercase();
        let role = normalize_role(&tag, &self.attributes);
        ElementState { tag, role, text: self.text, visible: self.visible, enabled: self.enabled, value: self.value }
    }

    fn into_element(self) -> InteractiveElement {
        InteractiveElement::new(self.tag, self.text, self.attributes, self.visible, self.enabled)
    }
}

fn script_err(e: impl Display) -> DriverError {
    DriverError::Script(e.to_string())
}

fn other(e: impl Display) -> DriverError {
    DriverError::Other(e.to_string())
}

/// Locates the descriptor's first match: css selector, then an optional
/// case-insensitive visible-text filter.
const FIND_JS: &str = r#"
const __find = (css, text) => {
  const norm = s => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const nodes = [...document.querySelectorAll(css)];
  if (text === null) return nodes[0] || null;
  const want = norm(text);
  return nodes.find(n => norm(n.innerText || n.value || n.getAttribute('aria-label')).includes(want)) || null;
};
"#;

/// Describes `el`; shares its attribute list with the snapshot walker.
const PROBE_JS: &str = r#"
const __probe = (el, keys) => {
  const attributes = {};
  for (const k of keys) {
    const v = el.getAttribute(k);
    if (v !== null && v !== '') attributes[k] = v;
  }
  const s = getComputedStyle(el);
  const r = el.getBoundingClientRect();
  const visible = s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0'
    && r.width > 0 && r.height > 0;
  const enabled = !el.disabled && el.getAttribute('aria-disabled') !== 'true';
  const text = (el.innerText || el.value || el.getAttribute('aria-label') || '').replace(/\s+/g, ' ').trim().slice(0, 120);
  const value = ('value' in el && typeof el.value === 'string') ? el.value : null;
  return { tag: el.tagName.toLowerCase(), text, attributes, visible, enabled, value };
};
"#;

fn attribute_keys() -> Vec<&'static str> {
    let mut keys = vec!["id", "name", "class", "type", "role", "aria-label", "placeholder", "href", "title"];
    keys.extend(TEST_ATTRIBUTES.iter().copied());
    keys
}

fn element_script(target: &Descriptor, body: &str) -> Result<String, DriverError> {
    let (css, text) = target.query_parts();
    let css = serde_json::to_string(&css).map_err(script_err)?;
    let text = serde_json::to_string(&text).map_err(script_err)?;
    let keys = serde_json::to_string(&attribute_keys()).map_err(script_err)?;
    Ok(format!(
        r#"(() => {{
{FIND_JS}
{PROBE_JS}
const KEYS = {keys};
let el;
try {{ el = __find({css}, {text}); }} catch (e) {{ return {{ found: false, error: String(e) }}; }}
if (!el) return {{ found: false }};
const value = (() => {{ {body} }})();
return {{ found: true, value }};
}})()"#
    ))
}

const CENTER_BODY: &str = r#"
el.scrollIntoView({ block: 'center', inline: 'center' });
const r = el.getBoundingClientRect();
return { x: r.left + r.width / 2, y: r.top + r.height / 2 };
"#;

const CLEAR_BODY: &str = r#"
el.focus();
if ('value' in el) {
  el.value = '';
  el.dispatchEvent(new Event('input', { bubbles: true }));
} else if (el.isContentEditable) {
  el.textContent = '';
}
return true;
"#;

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| DriverError::Navigation(format!("{}: {}", url, e)))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| DriverError::Navigation(format!("{}: {}", url, e)))?;
        Ok(())
    }

    async fn query(&self, descriptor: &Descriptor) -> Result<Option<ElementState>, DriverError> {
        match self.on_element::<RawElement>(descriptor, "return __probe(el, KEYS);").await {
            Ok(raw) => Ok(Some(raw.into_state())),
            Err(DriverError::Stale(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn click(&self, target: &Descriptor) -> Result<(), DriverError> {
        let center: Center = self.on_element(target, CENTER_BODY).await?;
        self.mouse_click(Point { x: center.x, y: center.y }).await
    }

    async fn set_text(&self, target: &Descriptor, value: &str) -> Result<(), DriverError> {
        let _: bool = self.on_element(target, CLEAR_BODY).await?;
        self.page
            .execute(InsertTextParams { text: value.to_string() })
            .await
            .map_err(other)?;
        let _: bool = self
            .on_element(target, "el.dispatchEvent(new Event('change', { bubbles: true })); return true;")
            .await?;
        Ok(())
    }

    async fn choose_option(&self, target: &Descriptor, value: &str) -> Result<(), DriverError> {
        let wanted = serde_json::to_string(value).map_err(script_err)?;
        let body = format!(
            r#"
const want = {wanted}.trim().toLowerCase();
const opts = [...(el.options || [])];
const hit = opts.find(o => o.value.toLowerCase() === want)
  || opts.find(o => o.text.trim().toLowerCase() === want)
  || opts.find(o => o.text.trim().toLowerCase().includes(want));
if (!hit) return false;
el.value = hit.value;
el.dispatchEvent(new Event('input', {{ bubbles: true }}));
el.dispatchEvent(new Event('change', {{ bubbles: true }}));
return true;
"#
        );
        let chosen: bool = self.on_element(target, &body).await?;
        if chosen {
            Ok(())
        } else {
            Err(DriverError::Other(format!("no option matching '{}' in {}", value, target)))
        }
    }

    async fn press_key(&self, target: &Descriptor, key: &str) -> Result<(), DriverError> {
        let _: bool = self.on_element(target, "el.focus(); return true;").await?;
        self.key_event(DispatchKeyEventType::KeyDown, key).await?;
        self.key_event(DispatchKeyEventType::KeyUp, key).await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.page.url().await.map_err(other)?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String, DriverError> {
        Ok(self.page.get_title().await.map_err(other)?.unwrap_or_default())
    }

    async fn read_visible_text(&self, target: Option<&Descriptor>) -> Result<String, DriverError> {
        match target {
            Some(t) => self.on_element(t, "return el.innerText || el.value || '';").await,
            None => self.eval("(() => (document.body ? document.body.innerText : ''))()".to_string()).await,
        }
    }

    async fn wait_for_settle(&self) -> Result<(), DriverError> {
        for _ in 0..20 {
            let state: String = self.eval("document.readyState".to_string()).await?;
            if state == "complete" {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        // late XHR-driven rendering
        sleep(Duration::from_millis(300)).await;
        Ok(())
    }

    async fn screenshot_b64(&self) -> Result<Option<String>, DriverError> {
        let bytes = self
            .page
            .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
            .await
            .map_err(other)?;
        Ok(Some(STANDARD.encode(bytes)))
    }
}

// ========================= Snapshot =========================

/// Walks the document for interactive elements. Hidden inputs and
/// zero-size nodes are skipped; everything else is reported with its
/// visibility so the planner can be told what it can act on.
const SNAPSHOT_JS: &str = r#"
const SELECTOR = 'a[href], button, input:not([type=hidden]), textarea, select, [role], [contenteditable=true], [onclick]';
const SKIP = new Set(['SCRIPT', 'STYLE', 'NOSCRIPT', 'SVG', 'LINK']);
const elements = [];
for (const el of document.querySelectorAll(SELECTOR)) {
  if (elements.length >= LIMIT) break;
  if (SKIP.has(el.tagName)) continue;
  const info = __probe(el, KEYS);
  const r = el.getBoundingClientRect();
  if (r.width === 0 && r.height === 0 && !info.visible) continue;
  elements.push(info);
}
return { url: location.href, title: document.title, elements };
"#;

const SNAPSHOT_LIMIT: usize = 300;

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    elements: Vec<RawElement>,
}

impl RawSnapshot {
    fn into_snapshot(self) -> PageSnapshot {
        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        PageSnapshot {
            id: nanoid!(),
            url: self.url,
            title: self.title,
            elements: self.elements.into_iter().map(RawElement::into_element).collect(),
            captured_at_ms,
        }
    }
}

/// [`PageInspector`] that reads interactive elements straight from the DOM.
#[derive(Clone, Copy, Default)]
pub struct DomInspector;

#[async_trait]
impl PageInspector<ChromiumDriver> for DomInspector {
    async fn snapshot(&self, session: &ChromiumDriver) -> Result<PageSnapshot, DriverError> {
        let keys = serde_json::to_string(&attribute_keys()).map_err(script_err)?;
        let js = format!(
            "(() => {{\n{PROBE_JS}\nconst KEYS = {keys};\nconst LIMIT = {SNAPSHOT_LIMIT};\n{SNAPSHOT_JS}\n}})()"
        );
        let raw: RawSnapshot = session
            .eval(js)
            .await
            .map_err(|e| DriverError::Snapshot(e.to_string()))?;
        let snapshot = raw.into_snapshot();
        debug!(url = %snapshot.url, elements = snapshot.elements.len(), "dom snapshot");
        Ok(snapshot)
    }
}
