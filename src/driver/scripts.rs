//! JavaScript injected into the page by the Chrome driver.
//!
//! Every call is wrapped in an IIFE that installs the helper object `H`,
//! receives its arguments as a JSON literal and returns `JSON.stringify`ed
//! output. Thrown exceptions come back as `{"__error": "..."}` so the Rust
//! side never depends on how the protocol reports them.
//!
//! Nested documents are addressed by the `data-wr-frame` key stamped on
//! their container element the first time it is entered, much like the
//! snapshot script of the agent tags interactive elements.

use serde_json::Value;

const HELPERS: &str = r#"{
  doc(hops) {
    let doc = document;
    for (const key of hops) {
      const frame = doc.querySelector('[data-wr-frame="' + key + '"]');
      if (!frame) return null;
      let inner = null;
      try { inner = frame.contentDocument; } catch (e) { inner = null; }
      if (!inner || !inner.documentElement) return null;
      doc = inner;
    }
    return doc;
  },
  visible(el) {
    if (!el || !el.isConnected) return false;
    const view = el.ownerDocument.defaultView;
    const style = view ? view.getComputedStyle(el) : null;
    if (style && (style.visibility === 'hidden' || style.display === 'none')) return false;
    const rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
  },
  all(args) {
    const d = this.doc(args.hops);
    return d ? Array.from(d.querySelectorAll(args.selector)) : null;
  },
  el(args) {
    const list = this.all(args);
    return list ? (list[args.index] || null) : null;
  },
  frames(doc) {
    return Array.from(doc.querySelectorAll('iframe, frame')).filter(f => this.visible(f));
  },
  key(frame) {
    if (!frame.getAttribute('data-wr-frame')) {
      window.__wrSeq = (window.__wrSeq || 0) + 1;
      frame.setAttribute('data-wr-frame', 'wr' + window.__wrSeq);
    }
    return frame.getAttribute('data-wr-frame');
  },
  enter(frame) {
    let inner = null;
    try { inner = frame.contentDocument; } catch (e) { inner = null; }
    return inner && inner.documentElement ? this.key(frame) : null;
  },
  topRect(el) {
    const r = el.getBoundingClientRect();
    let x = r.left, y = r.top;
    let win = el.ownerDocument.defaultView;
    while (win && win.frameElement) {
      const fr = win.frameElement.getBoundingClientRect();
      x += fr.left + win.frameElement.clientLeft;
      y += fr.top + win.frameElement.clientTop;
      win = win.parent;
    }
    return { x, y, width: r.width, height: r.height };
  }
}"#;

/// Probe the `index`-th match (default first) and report whether it satisfies the wanted state.
pub(crate) const PROBE: &str = r#"
  const list = H.all(args);
  if (!list) return { state: 'no-scope' };
  const el = list[args.index || 0];
  if (!el) return { state: 'missing' };
  if (args.visible && !H.visible(el)) return { state: 'hidden' };
  return { state: 'ok' };
"#;

pub(crate) const COUNT: &str = r#"
  const list = H.all(args);
  return list ? list.length : -1;
"#;

pub(crate) const COUNT_FRAMES: &str = r#"
  const d = H.doc(args.hops);
  return d ? H.frames(d).length : -1;
"#;

pub(crate) const CHILD_FRAME: &str = r#"
  const d = H.doc(args.hops);
  if (!d) return { gone: true };
  const f = H.frames(d)[args.index];
  if (!f) return { key: null };
  return { key: H.enter(f) };
"#;

pub(crate) const FRAME_BY_SELECTOR: &str = r#"
  const d = H.doc(args.hops);
  if (!d) return { gone: true };
  const f = d.querySelector(args.selector);
  if (!f) return { key: null };
  if (!/^(IFRAME|FRAME)$/.test(f.tagName)) return { __error: 'element is not a frame: ' + f.tagName };
  return { key: H.enter(f) };
"#;

/// Scrolls the element into view and returns its centre in top-level coordinates.
pub(crate) const CENTER: &str = r#"
  const el = H.el(args);
  if (!el) return null;
  el.scrollIntoView({ block: 'center', inline: 'center' });
  const r = H.topRect(el);
  return { x: r.x + r.width / 2, y: r.y + r.height / 2, visible: H.visible(el) };
"#;

pub(crate) const FILL: &str = r#"
  const el = H.el(args);
  if (!el) return { found: false };
  el.focus();
  if (el.isContentEditable) {
    el.textContent = args.value;
  } else {
    const desc = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
    if (desc && desc.set) desc.set.call(el, args.value); else el.value = args.value;
  }
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return { found: true };
"#;

pub(crate) const READ: &str = r#"
  const el = H.el(args);
  if (!el) return { found: false };
  switch (args.what) {
    case 'inner_text': return { found: true, value: el.innerText };
    case 'text_content': return { found: true, value: el.textContent };
    case 'inner_html': return { found: true, value: el.innerHTML };
    case 'attribute': return { found: true, value: el.getAttribute(args.name) };
  }
  return { __error: 'unknown read: ' + args.what };
"#;

pub(crate) const SELECT: &str = r#"
  const el = H.el(args);
  if (!el) return { found: false };
  if (el.tagName !== 'SELECT') return { __error: 'element is not a <select>' };
  const opts = Array.from(el.options);
  let idx = -1;
  if (args.by === 'value') idx = opts.findIndex(o => o.value === args.value);
  else if (args.by === 'label') idx = opts.findIndex(o => (o.label || o.text).trim() === args.value);
  else idx = Number(args.value) < opts.length ? Number(args.value) : -1;
  if (idx < 0) return { found: true, selected: false };
  el.selectedIndex = idx;
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return { found: true, selected: true };
"#;

pub(crate) const SCROLL_INTO_VIEW: &str = r#"
  const el = H.el(args);
  if (!el) return { found: false };
  el.scrollIntoView({ block: 'center', inline: 'nearest' });
  return { found: true };
"#;

/// Element box in page coordinates, for a clipped screenshot.
pub(crate) const CLIP_RECT: &str = r#"
  const el = H.el(args);
  if (!el) return null;
  el.scrollIntoView({ block: 'center', inline: 'center' });
  const r = H.topRect(el);
  return { x: r.x + window.scrollX, y: r.y + window.scrollY, width: r.width, height: r.height };
"#;

pub(crate) const PAGE_SIZE: &str = r#"
  const root = document.documentElement;
  const body = document.body;
  return {
    width: Math.max(root.scrollWidth, body ? body.scrollWidth : 0),
    height: Math.max(root.scrollHeight, body ? body.scrollHeight : 0)
  };
"#;

pub(crate) const READY_STATE: &str = "return document.readyState;";

pub(crate) const SCROLL_TO_BOTTOM: &str = r#"
  window.scrollTo(0, document.body ? document.body.scrollHeight : 0);
  return true;
"#;

/// Builds the final expression for `body` with `args` bound.
pub(crate) fn call(body: &str, args: &Value) -> String {
    format!(
        "(() => {{ const H = {HELPERS}; const args = {args}; \
         let out; try {{ out = (function(H, args) {{ {body} }})(H, args); }} \
         catch (e) {{ out = {{ __error: String(e && e.message ? e.message : e) }}; }} \
         return JSON.stringify(out === undefined ? null : out); }})()"
    )
}
