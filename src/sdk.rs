//! Browser assets: the connect page and the script that runs bridge directives.

pub fn connect_page() -> String {
    r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>FinanceFly · Connect your bank</title>
  <style>
    body { font-family: system-ui, sans-serif; background: #10131a; color: #e8eaf0; margin: 0; }
    main { max-width: 560px; margin: 48px auto; padding: 0 16px; }
    form { display: grid; gap: 12px; margin-bottom: 24px; }
    input, button { font: inherit; padding: 10px 12px; border-radius: 6px; border: 1px solid #2c3242; }
    input { background: #181c26; color: inherit; }
    button { background: #3b6cf6; color: #fff; cursor: pointer; border: none; }
    button:disabled { opacity: 0.6; cursor: progress; }
    #status { min-height: 1.5em; margin-bottom: 8px; }
    #status.loading { color: #f0c36b; }
    #status.success { color: #6bd49a; }
    #status.error { color: #f07a7a; }
    #notice { color: #8fb3ff; min-height: 1.2em; }
    #log { list-style: none; padding: 0; font-size: 0.85em; max-height: 320px; overflow-y: auto; }
    #log li { padding: 2px 0; border-bottom: 1px solid #1d2230; }
    #log .warning { color: #f0c36b; }
    #log .error { color: #f07a7a; }
    #log .success { color: #6bd49a; }
  </style>
</head>
<body>
<main>
  <h1>Connect your bank</h1>
  <form id="connect-form">
    <input name="name" placeholder="Name" autocomplete="name">
    <input name="email" type="email" placeholder="Email" autocomplete="email">
    <button id="connect-button" type="submit">Connect account</button>
  </form>
  <div id="status"></div>
  <div id="notice"></div>
  <ul id="log"></ul>
</main>
<script src="/connect.js"></script>
</body>
</html>
"#
    .to_string()
}

pub fn bridge_script() -> String {
    r#"// FinanceFly connect bridge: executes server directives against window.PluggyConnect
(function(global) {
  const widgets = new Map();
  let pageId = null;

  async function report(body) {
    if (!pageId) return;
    try {
      await fetch("/api/connect/reports?page=" + encodeURIComponent(pageId), {
        method: "POST",
        headers: { "Content-Type": "application/json" },
        body: JSON.stringify(body),
      });
    } catch (err) {
      console.warn("FinanceFly: failed to send report", err);
    }
  }

  function injectTag(id, src) {
    const script = document.createElement("script");
    script.src = src;
    script.async = true;
    script.onload = () => report({ type: "script-loaded", id });
    script.onerror = () =>
      report({ type: "script-failed", id, message: "failed to load " + src });
    document.head.appendChild(script);
  }

  async function injectBlob(id, src) {
    try {
      const res = await fetch(src);
      if (!res.ok) throw new Error("HTTP " + res.status);
      const text = await res.text();
      const url = URL.createObjectURL(new Blob([text], { type: "text/javascript" }));
      const script = document.createElement("script");
      script.src = url;
      script.onload = () => {
        URL.revokeObjectURL(url);
        report({ type: "script-loaded", id });
      };
      script.onerror = () => {
        URL.revokeObjectURL(url);
        report({ type: "script-failed", id, message: "blob script failed", duringExecution: true });
      };
      document.head.appendChild(script);
    } catch (err) {
      report({ type: "script-failed", id, message: String(err) });
    }
  }

  function surface() {
    const sdk = global.PluggyConnect;
    if (!sdk) return null;
    return {
      hasFactory: typeof sdk.create === "function",
      constructible: typeof sdk === "function",
      prototypeOpen: !!(sdk.prototype && typeof sdk.prototype.open === "function"),
      globalOpen: typeof sdk.open === "function",
    };
  }

  function construct(widgetId, style, options) {
    const sdk = global.PluggyConnect;
    const send = (event, extra) => report(Object.assign({ type: "widget", widget: widgetId, event }, extra));
    const opts = Object.assign({}, options, {
      onOpen: () => send("open"),
      onClose: () => send("close"),
      onError: (error) =>
        send("error", {
          error: {
            message: (error && error.message) || String(error),
            code: (error && error.code) || null,
          },
        }),
      onSuccess: (data) => send("success", { data: data || {} }),
    });
    try {
      const instance = style === "factory" ? sdk.create(opts) : new sdk(opts);
      widgets.set(widgetId, instance);
    } catch (err) {
      send("error", { error: { message: String(err), code: null } });
    }
  }

  function open(widgetId, target) {
    try {
      if (target === "instance") {
        widgets.get(widgetId).open();
      } else {
        global.PluggyConnect.open();
      }
    } catch (err) {
      report({ type: "widget", widget: widgetId, event: "error", error: { message: String(err), code: null } });
    }
  }

  function handle(directive) {
    switch (directive.type) {
      case "inject-script":
        if (directive.mode === "fetch-blob") injectBlob(directive.id, directive.url);
        else injectTag(directive.id, directive.url);
        break;
      case "probe":
        report({ type: "surface", id: directive.id, surface: surface() });
        break;
      case "construct":
        construct(directive.widget, directive.style, directive.options);
        break;
      case "open":
        open(directive.widget, directive.target);
        break;
      default:
        console.warn("FinanceFly: unknown directive", directive);
    }
  }

  // every (re)connect registers a fresh page; the server reloads the SDK into it
  const events = new EventSource("/api/connect/directives");
  events.addEventListener("hello", (msg) => {
    pageId = JSON.parse(msg.data).page;
    widgets.clear();
  });
  events.addEventListener("directive", (msg) => handle(JSON.parse(msg.data)));

  const form = document.getElementById("connect-form");
  const button = document.getElementById("connect-button");
  const statusEl = document.getElementById("status");
  const noticeEl = document.getElementById("notice");
  const logEl = document.getElementById("log");

  function render(state) {
    const status = state.status || {};
    statusEl.className = status.status || "";
    statusEl.textContent = status.label || "";
    noticeEl.textContent = status.notice || "";
    button.disabled = !!state.inProgress;
    logEl.innerHTML = "";
    (state.log || []).slice().reverse().forEach((entry) => {
      const li = document.createElement("li");
      li.className = entry.level;
      li.textContent = "[" + new Date(entry.timestamp).toLocaleTimeString() + "] " + entry.message;
      logEl.appendChild(li);
    });
  }

  async function refresh() {
    try {
      const res = await fetch("/api/connect/status");
      if (res.ok) render(await res.json());
    } catch (err) {
      console.warn("FinanceFly: status refresh failed", err);
    }
  }

  form.addEventListener("submit", async (ev) => {
    ev.preventDefault();
    if (button.disabled) return;
    button.disabled = true;
    const data = new FormData(form);
    try {
      const query = pageId ? "?page=" + encodeURIComponent(pageId) : "";
      const res = await fetch("/api/connect/start" + query, {
        method: "POST",
        headers: { "Content-Type": "application/json" },
        body: JSON.stringify({ name: data.get("name"), email: data.get("email") }),
      });
      if (res.status === 409) console.info("FinanceFly: connection already in progress");
    } finally {
      refresh();
    }
  });

  setInterval(refresh, 1000);
  refresh();
})(window);
"#
    .to_string()
}
