//! Chromium session management.
//!
//! One browser, one page, one proxy per worker. The browser rides the
//! worker's claimed proxy via `--proxy-server`; authenticated proxies
//! are answered through the Fetch domain with the credentials stored in
//! the pool. Rotating proxies means tearing the session down and
//! launching a fresh one.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, AuthChallengeSource,
    ContinueRequestParams, ContinueWithAuthParams, EnableParams as FetchEnableParams,
    EventAuthRequired, EventRequestPaused,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::Proxy;

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

fn find_chrome() -> Result<PathBuf> {
    for path in CHROME_PATHS {
        let p = std::path::Path::new(path);
        if p.exists() {
            debug!("found Chrome at {path}");
            return Ok(p.to_path_buf());
        }
    }

    for cmd in &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    debug!("found Chrome in PATH: {path}");
                    return Ok(PathBuf::from(path));
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "Chrome/Chromium not found; install chromium or google-chrome"
    ))
}

/// Answer upstream proxy auth challenges on a page with the pool
/// credentials.
///
/// Chromium cannot take proxy credentials on the command line, so the
/// Fetch domain is enabled with `handle_auth_requests` and every
/// `authRequired` event from the proxy is answered with
/// `ProvideCredentials`. Enabling Fetch also pauses every request, so a
/// second listener resumes them untouched. Returns the listener tasks so
/// the session can abort them on close.
async fn spawn_proxy_auth_handlers(
    page: &Page,
    username: String,
    password: String,
) -> Result<Vec<JoinHandle<()>>> {
    let mut enable = FetchEnableParams::default();
    enable.handle_auth_requests = Some(true);
    page.execute(enable)
        .await
        .context("failed to enable fetch auth handling")?;

    let mut auth_events = page
        .event_listener::<EventAuthRequired>()
        .await
        .context("failed to listen for auth challenges")?;
    let auth_page = page.clone();
    let auth_task = tokio::spawn(async move {
        while let Some(event) = auth_events.next().await {
            let response = if matches!(
                event.auth_challenge.source,
                Some(AuthChallengeSource::Proxy)
            ) {
                AuthChallengeResponse {
                    response: AuthChallengeResponseResponse::ProvideCredentials,
                    username: Some(username.clone()),
                    password: Some(password.clone()),
                }
            } else {
                // Site-level challenges are not ours to answer.
                AuthChallengeResponse {
                    response: AuthChallengeResponseResponse::Default,
                    username: None,
                    password: None,
                }
            };
            let params = ContinueWithAuthParams::new(event.request_id.clone(), response);
            if auth_page.execute(params).await.is_err() {
                break;
            }
        }
    });

    let mut paused_events = page
        .event_listener::<EventRequestPaused>()
        .await
        .context("failed to listen for paused requests")?;
    let continue_page = page.clone();
    let continue_task = tokio::spawn(async move {
        while let Some(event) = paused_events.next().await {
            let params = ContinueRequestParams::new(event.request_id.clone());
            if continue_page.execute(params).await.is_err() {
                break;
            }
        }
    });

    Ok(vec![auth_task, continue_task])
}

/// A running Chromium with a single open page, routed through one proxy.
pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    auth_tasks: Vec<JoinHandle<()>>,
    page: Page,
    proxy_id: i64,
}

impl BrowserSession {
    /// Launch Chromium through the given proxy and open a blank page.
    /// Credentialed proxies get a Fetch-domain auth handler so 407
    /// challenges are answered instead of burning proxy strikes.
    pub async fn launch(proxy: &Proxy) -> Result<Self> {
        let chrome_path = find_chrome()?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg(format!("--proxy-server={}", proxy.server_addr()))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to open page")?;

        let auth_tasks = if proxy.has_credentials() {
            debug!(proxy_id = proxy.id, "answering proxy auth challenges");
            spawn_proxy_auth_handlers(
                &page,
                proxy.username.clone().unwrap_or_default(),
                proxy.password.clone().unwrap_or_default(),
            )
            .await?
        } else {
            Vec::new()
        };

        info!(
            proxy_id = proxy.id,
            proxy = %proxy.server_addr(),
            "browser session ready"
        );

        Ok(Self {
            browser,
            handler_task,
            auth_tasks,
            page,
            proxy_id: proxy.id,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Id of the proxy this session rides.
    pub fn proxy_id(&self) -> i64 {
        self.proxy_id
    }

    /// Shut the browser down, bounded; a hung Chromium is abandoned to
    /// the OS once its CDP handler is aborted.
    pub async fn close(mut self) {
        for task in &self.auth_tasks {
            task.abort();
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, self.browser.close())
            .await
            .is_err()
        {
            debug!("browser close timed out, abandoning process");
        }
        self.handler_task.abort();
    }
}
