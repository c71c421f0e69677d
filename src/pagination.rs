use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::client::EsiClient;
use crate::error::{EsiError, PipelineError};
use crate::pipeline::{FetchOptions, WithMeta};

/// Reported after each page completes, so a caller can drive a progress bar across a
/// multi-page fetch.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl EsiClient {
    /// Fetches every page of a paginated endpoint sequentially and concatenates the
    /// results. Equivalent to `fetch_paginated_with_meta` with the metadata dropped.
    pub async fn fetch_paginated<T: serde::de::DeserializeOwned>(self: &Arc<Self>, endpoint: &str, options: FetchOptions) -> Result<Vec<T>, EsiError> {
        Ok(self.fetch_paginated_with_meta(endpoint, options).await?.data)
    }

    pub async fn fetch_paginated_with_meta<T: serde::de::DeserializeOwned>(self: &Arc<Self>, endpoint: &str, options: FetchOptions) -> Result<WithMeta<Vec<T>>, EsiError> {
        let mut page = 1u32;
        let mut total_pages = 1u32;
        let mut items = Vec::new();
        let mut last_expires_at = None;
        let mut last_etag = None;

        loop {
            let page_endpoint = with_page_param(endpoint, page);
            let page_options = FetchOptions { etag_override: None, ..options.clone() };
            let resp = self.execute_with_rate_limit(&page_endpoint, page_options).await?;

            extend_with_page(&mut items, resp.data);
            if let Some(x_pages) = resp.meta.x_pages {
                total_pages = x_pages;
            }
            if resp.meta.expires_at.is_some() {
                last_expires_at = resp.meta.expires_at;
            }
            if resp.meta.etag.is_some() {
                last_etag = resp.meta.etag;
            }

            page += 1;
            if page > total_pages {
                break;
            }
        }

        finish(items, last_expires_at, last_etag)
    }

    /// Fetches page 1 to learn the page count, then fetches the rest concurrently
    /// (bounded by `config.max_concurrent_pages`), invoking `on_progress` as pages
    /// complete. A failure on any page aborts the whole fetch.
    pub async fn fetch_paginated_with_progress<T, F>(self: &Arc<Self>, endpoint: &str, options: FetchOptions, on_progress: F) -> Result<WithMeta<Vec<T>>, EsiError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(Progress) + Send + Sync + 'static,
    {
        let on_progress = Arc::new(on_progress);

        let first_options = FetchOptions { etag_override: None, ..options.clone() };
        let first = self.execute_with_rate_limit(&with_page_param(endpoint, 1), first_options).await?;

        let total_pages = first.meta.x_pages.unwrap_or(1).max(1);
        let mut last_expires_at = first.meta.expires_at;
        let mut last_etag = first.meta.etag.clone();

        let mut pages: Vec<Option<serde_json::Value>> = vec![None; total_pages as usize];
        pages[0] = Some(first.data);
        on_progress(Progress { completed: 1, total: total_pages as usize });

        if total_pages > 1 {
            let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_concurrent_pages.max(1)));
            let completed = Arc::new(AtomicU64::new(1));
            let mut tasks = Vec::with_capacity(total_pages as usize - 1);

            for page in 2..=total_pages {
                let client = self.clone();
                let page_options = FetchOptions { etag_override: None, ..options.clone() };
                let endpoint = endpoint.to_string();
                let semaphore = semaphore.clone();
                let completed = completed.clone();
                let on_progress = on_progress.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                    let result = client.execute_with_rate_limit(&with_page_param(&endpoint, page), page_options).await;
                    if result.is_ok() {
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        on_progress(Progress { completed: done as usize, total: total_pages as usize });
                    }
                    (page, result)
                }));
            }

            for task in tasks {
                let (page, result) = task.await.map_err(|err| EsiError::new(format!("pagination task panicked: {err}"), 0))?;
                let resp = result?;
                if resp.meta.expires_at.is_some() {
                    last_expires_at = resp.meta.expires_at;
                }
                if resp.meta.etag.is_some() {
                    last_etag = resp.meta.etag.clone();
                }
                pages[(page - 1) as usize] = Some(resp.data);
            }
        }

        let mut items = Vec::new();
        for page in pages {
            extend_with_page(&mut items, page.expect("every page slot is filled once all tasks succeed"));
        }

        finish(items, last_expires_at, last_etag)
    }
}

fn with_page_param(endpoint: &str, page: u32) -> String {
    if endpoint.contains('?') {
        format!("{endpoint}&page={page}")
    } else {
        format!("{endpoint}?page={page}")
    }
}

fn extend_with_page(items: &mut Vec<serde_json::Value>, page_data: serde_json::Value) {
    match page_data {
        serde_json::Value::Array(mut values) => items.append(&mut values),
        other => items.push(other),
    }
}

fn finish<T: serde::de::DeserializeOwned>(items: Vec<serde_json::Value>, expires_at: Option<u64>, etag: Option<String>) -> Result<WithMeta<Vec<T>>, EsiError> {
    let expires_at = expires_at.ok_or(PipelineError::PaginationMissingMeta)?;
    let data = items
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<T>, _>>()
        .map_err(|err| EsiError::new(format!("failed to decode paginated response: {err}"), 0))?;
    Ok(WithMeta { data, expires_at: Some(expires_at), etag, not_modified: false })
}
