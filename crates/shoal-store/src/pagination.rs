//! Pagination ledger.
//!
//! For every query identifier (`qid`) the ledger remembers which ids each
//! remote find returned, keyed by query fingerprint and page fingerprint.
//! Only the find-response path writes here; reads serve cached pages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::{Identity, PageParams, QueryInfo, fingerprint_record, query_info};
use crate::service::FindResult;
use crate::types::{Params, Record};
use crate::updates::{StoreUpdate, UpdateSender};

/// Ids returned for one page of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
    pub ids: Vec<String>,
    pub page_params: Option<PageParams>,
    pub queried_at: DateTime<Utc>,
    /// Server-rendered data not yet consumed by a find.
    pub ssr: bool,
}

/// Every recorded page of one query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEntry {
    pub total: usize,
    pub query_params: Record,
    pub pages: HashMap<String, PageEntry>,
}

/// The last query recorded for a qid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MostRecent {
    pub query: Record,
    pub query_id: String,
    pub query_params: Record,
    pub page_id: Option<String>,
    pub page_params: Option<PageParams>,
}

/// Ledger for one query identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QidLedger {
    pub most_recent: Option<MostRecent>,
    /// Page size the service applied when the query set none.
    pub default_limit: Option<usize>,
    pub default_skip: Option<usize>,
    pub queries: HashMap<String, QueryEntry>,
}

/// A page located in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPage {
    pub info: QueryInfo,
    pub total: usize,
    pub entry: PageEntry,
}

/// Page bookkeeping keyed by (qid, query fingerprint, page fingerprint).
pub struct PaginationLedger {
    qids: DashMap<String, QidLedger>,
    updates: UpdateSender,
}

fn unpaged_key() -> String {
    fingerprint_record(&Record::new())
}

impl PaginationLedger {
    pub fn new(updates: UpdateSender) -> Self {
        Self {
            qids: DashMap::new(),
            updates,
        }
    }

    /// Record a find response.
    ///
    /// Overwrites the page entry for this query and page shape, refreshes
    /// the qid's `most_recent` pointer and returns the derived keys.
    pub fn record_page(
        &self,
        params: &Params,
        result: &FindResult,
        identity: &Identity,
        ssr: bool,
    ) -> QueryInfo {
        let (total, limit, skip) = match result {
            FindResult::Page(page) => (page.total, Some(page.limit), Some(page.skip)),
            FindResult::All(data) => (data.len(), None, None),
        };
        let info = query_info(params, limit, skip);
        let page_key = info.page_id.clone().unwrap_or_else(unpaged_key);
        let ids = result
            .data()
            .iter()
            .filter_map(|record| identity.any_id_of(record))
            .collect::<Vec<_>>();

        {
            let mut ledger = self.qids.entry(info.qid.clone()).or_default();
            if result.is_paginated() {
                if ledger.default_limit.is_none() && !info.query.contains_key("$limit") {
                    ledger.default_limit = limit;
                }
                if ledger.default_skip.is_none() && !info.query.contains_key("$skip") {
                    ledger.default_skip = skip;
                }
            }

            let query = ledger
                .queries
                .entry(info.query_id.clone())
                .or_insert_with(|| QueryEntry {
                    total,
                    query_params: info.query_params.clone(),
                    pages: HashMap::new(),
                });
            query.total = total;
            query.pages.insert(
                page_key,
                PageEntry {
                    ids,
                    page_params: info.page_params,
                    queried_at: Utc::now(),
                    ssr,
                },
            );

            ledger.most_recent = Some(MostRecent {
                query: info.query.clone(),
                query_id: info.query_id.clone(),
                query_params: info.query_params.clone(),
                page_id: info.page_id.clone(),
                page_params: info.page_params,
            });
        }

        debug!(
            qid = %info.qid,
            query_id = %info.query_id,
            page_id = ?info.page_id,
            total,
            "recorded find page"
        );
        self.updates.send(StoreUpdate::PageRecorded {
            qid: info.qid.clone(),
            query_id: info.query_id.clone(),
            page_id: info.page_id.clone(),
        });
        info
    }

    /// Locate the recorded page `params` would request.
    ///
    /// Missing `$limit`/`$skip` fall back to the defaults the service applied
    /// the first time this qid was queried.
    pub fn cached_page(&self, params: &Params) -> Option<CachedPage> {
        let qid = params
            .qid
            .as_deref()
            .unwrap_or(crate::identity::DEFAULT_QID);
        let ledger = self.qids.get(qid)?;
        let query = params.query.clone().unwrap_or_default();
        let limit = query
            .get("$limit")
            .and_then(crate::types::as_count)
            .or(ledger.default_limit);
        let skip = query
            .get("$skip")
            .and_then(crate::types::as_count)
            .or(ledger.default_skip);
        let info = query_info(params, limit, skip);

        let entry = ledger.queries.get(&info.query_id)?;
        let page_key = info.page_id.clone().unwrap_or_else(unpaged_key);
        let page = entry.pages.get(&page_key)?.clone();
        Some(CachedPage {
            total: entry.total,
            entry: page,
            info,
        })
    }

    /// Clear the SSR flag of a page. Returns whether it was set.
    pub fn take_ssr(&self, qid: &str, query_id: &str, page_key: Option<&str>) -> bool {
        let Some(mut ledger) = self.qids.get_mut(qid) else {
            return false;
        };
        let key = page_key.map_or_else(unpaged_key, str::to_string);
        match ledger
            .queries
            .get_mut(query_id)
            .and_then(|query| query.pages.get_mut(&key))
        {
            Some(page) if page.ssr => {
                page.ssr = false;
                debug!(qid, query_id, "consumed ssr page");
                true
            }
            _ => false,
        }
    }

    /// Copy of one qid's ledger.
    pub fn qid(&self, qid: &str) -> Option<QidLedger> {
        self.qids.get(qid).map(|ledger| ledger.clone())
    }

    pub fn qids(&self) -> Vec<String> {
        let mut qids: Vec<String> = self.qids.iter().map(|e| e.key().clone()).collect();
        qids.sort();
        qids
    }

    /// Copy of every qid's ledger.
    pub fn snapshot(&self) -> HashMap<String, QidLedger> {
        self.qids
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.qids.clear();
    }
}
