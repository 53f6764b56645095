use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChromiumSection;

use super::error::{DriverError, DriverResult};

#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub headless: Option<bool>,
}

/// Config-driven Chromium launcher. One launched browser serves the whole
/// crawl; each worker session gets its own page from it.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: ChromiumSection,
}

impl BrowserLauncher {
    pub fn new(config: ChromiumSection) -> Self {
        Self { config }
    }

    pub async fn launch(&self) -> DriverResult<PortalBrowser> {
        self.launch_with_overrides(LaunchOverrides::default()).await
    }

    pub async fn launch_with_overrides(
        &self,
        overrides: LaunchOverrides,
    ) -> DriverResult<PortalBrowser> {
        let headless = overrides.headless.unwrap_or(self.config.headless);
        let chromium_config = self.build_chromium_config(headless)?;
        info!(
            width = self.config.window[0],
            height = self.config.window[1],
            headless,
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(PortalBrowser {
            browser,
            handler_task: Some(handler_task),
        })
    }

    fn build_chromium_config(&self, headless: bool) -> DriverResult<ChromiumConfig> {
        let [width, height] = self.config.window;
        let mut builder = ChromiumConfig::builder().viewport(ChromiumViewport {
            width,
            height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: width >= height,
            has_touch: false,
        });

        if let Some(executable) = &self.config.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![format!("--window-size={width},{height}")];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if self.config.mute_audio {
            args.push("--mute-audio".into());
        }
        args.push("--no-first-run".into());
        args.push("--disable-background-timer-throttling".into());
        builder = builder.args(args);

        builder.build().map_err(DriverError::Launch)
    }
}

#[derive(Debug)]
pub struct PortalBrowser {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
}

impl PortalBrowser {
    pub async fn new_page(&self) -> DriverResult<Page> {
        let params = CreateTargetParams::new("about:blank");
        Ok(self.browser.new_page(params).await?)
    }

    pub async fn shutdown(mut self) -> DriverResult<()> {
        info!("shutting down chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for PortalBrowser {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("PortalBrowser dropped without explicit shutdown");
            }
        }
    }
}
