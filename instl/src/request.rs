// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use once_cell::sync::Lazy;
use reqwest::Result;
use url::Url;

/// How long a single sync request may sit idle before giving up, so an
/// unattended install fails fast against a dead mirror instead of hanging.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared client for connection reuse across every file synced in a run.
static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("build reqwest client")
});

/// Fetch `url` and stream its response body, failing before the first byte
/// if the server answers with anything other than a 2xx status.
pub async fn get(url: Url) -> Result<impl Stream<Item = Result<Bytes>>> {
    let response = CLIENT.get(url).send().await?;

    response.error_for_status().map(reqwest::Response::bytes_stream)
}
