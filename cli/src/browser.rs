/*
    dw-archiver | Rust tool to archive Discover Weekly into a persistent playlist.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::shim::{BrowserDriver, ShimError};
use async_trait::async_trait;
use fantoccini::{elements::Element, error::CmdError, Client, ClientBuilder, Locator};
use log::debug;
use serde_json::json;
use std::time::Duration;

/// [`BrowserDriver`] speaking the W3C WebDriver protocol, e.g. to a local chromedriver.
pub struct FantocciniDriver {
    webdriver_url: String,
    headless: bool,
    client: Option<Client>,
}

impl FantocciniDriver {
    pub fn new(webdriver_url: &str, headless: bool) -> Self {
        Self {
            webdriver_url: webdriver_url.to_string(),
            headless,
            client: None,
        }
    }

    fn client(&self) -> Result<&Client, ShimError> {
        self.client
            .as_ref()
            .ok_or_else(|| ShimError::Browser("Browser session is not open".to_string()))
    }

    async fn find(&self, element_id: &str) -> Result<Element, ShimError> {
        self.client()?
            .find(Locator::Id(element_id))
            .await
            .map_err(|e| match e {
                e if e.is_no_such_element() => ShimError::ElementNotFound(element_id.to_string()),
                other => browser_error(other),
            })
    }
}

fn browser_error(e: impl std::fmt::Display) -> ShimError {
    ShimError::Browser(e.to_string())
}

/// Only a timed-out wait or a missing element means the page lacks the element.
fn wait_error(element_id: &str, e: CmdError) -> ShimError {
    match e {
        CmdError::WaitTimeout => ShimError::ElementNotFound(element_id.to_string()),
        e if e.is_no_such_element() => {
            ShimError::ElementNotFound(element_id.to_string())
        }
        other => browser_error(other),
    }
}

#[async_trait]
impl BrowserDriver for FantocciniDriver {
    async fn open(&mut self) -> Result<(), ShimError> {
        let mut capabilities = serde_json::Map::new();
        if self.headless {
            capabilities.insert(
                "goog:chromeOptions".to_string(),
                json!({ "args": ["--headless=new"] }),
            );
            capabilities.insert(
                "moz:firefoxOptions".to_string(),
                json!({ "args": ["-headless"] }),
            );
        }

        let mut builder = ClientBuilder::native();
        builder.capabilities(capabilities);
        let client = builder
            .connect(&self.webdriver_url)
            .await
            .map_err(browser_error)?;

        debug!("WebDriver session opened at {}", self.webdriver_url);
        self.client = Some(client);
        Ok(())
    }

    async fn visit(&mut self, url: &str) -> Result<(), ShimError> {
        self.client()?.goto(url).await.map_err(browser_error)
    }

    async fn wait_for(&mut self, element_id: &str, timeout: Duration) -> Result<(), ShimError> {
        self.client()?
            .wait()
            .at_most(timeout)
            .for_element(Locator::Id(element_id))
            .await
            .map(|_| ())
            .map_err(|e| wait_error(element_id, e))
    }

    async fn fill(&mut self, element_id: &str, text: &str) -> Result<(), ShimError> {
        let input = self.find(element_id).await?;
        input.clear().await.map_err(browser_error)?;
        input.send_keys(text).await.map_err(browser_error)
    }

    async fn click(&mut self, element_id: &str) -> Result<(), ShimError> {
        self.find(element_id)
            .await?
            .click()
            .await
            .map_err(browser_error)
    }

    async fn close(&mut self) -> Result<(), ShimError> {
        if let Some(client) = self.client.take() {
            client.close().await.map_err(browser_error)?;
            debug!("WebDriver session closed");
        }
        Ok(())
    }
}
