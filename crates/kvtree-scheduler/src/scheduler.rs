//! Prefix-aware continuous batching scheduler
//!
//! Requests move `Queued -> Prefilling -> Decoding -> Completed`, or to
//! `Aborted` from any non-terminal state. Every in-flight request holds exactly
//! one lock in the tree, on the node covering its cached prefix, plus the pages
//! it reserved for positions beyond that prefix. Completed work is committed to
//! the tree after each batch so later requests can reuse it.
//!
//! When decoding runs out of pages and eviction frees nothing, the newest
//! decoding requests are preempted: they drop their lock and reserved pages
//! and go back to the front of the queue with what they generated so far.

use crate::{Batch, BatchEntry, BatchKind, SchedulerMetrics, WaitingQueue};
use chrono::{DateTime, Utc};
use kvtree_cache::{MatchResult, NodeId, PageAllocator, PagePool, PrefixTree};
use kvtree_types::{
    BatchResult, KvTreeConfig, KvTreeError, PageId, Request, RequestId, RequestState, Result,
    SchedulePolicy, SchedulerConfig, TokenId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Admitted request and the cache resources it holds
#[derive(Debug, Clone)]
struct ScheduledRequest {
    request: Request,
    state: RequestState,
    /// Prompt followed by generated tokens
    tokens: Vec<TokenId>,
    /// Locked node whose path covers the cached prefix
    node: NodeId,
    /// Leading tokens backed by tree pages, page aligned
    cached_len: usize,
    /// Tree pages for the cached prefix
    tree_pages: Vec<PageId>,
    /// Pages reserved for positions from `cached_len` on, owned by this request
    owned_pages: Vec<PageId>,
    admitted_at: DateTime<Utc>,
}

impl ScheduledRequest {
    fn id(&self) -> &RequestId {
        &self.request.id
    }

    fn output(&self) -> &[TokenId] {
        &self.tokens[self.request.prompt.len()..]
    }

    /// Token positions that have a page behind them
    fn slots(&self, page_size: usize) -> usize {
        self.cached_len + self.owned_pages.len() * page_size
    }

    /// Tokens whose KV has been computed. The newest generated token only gets
    /// its KV on the next decode step.
    fn kv_len(&self) -> usize {
        if self.output().is_empty() {
            self.request.prompt.len()
        } else {
            self.tokens.len() - 1
        }
    }

    fn page_table(&self) -> Vec<PageId> {
        let mut pages = self.tree_pages.clone();
        pages.extend_from_slice(&self.owned_pages);
        pages
    }

    fn prefill_entry(&self) -> BatchEntry {
        BatchEntry {
            request_id: self.id().clone(),
            tokens: self.tokens[self.cached_len..].to_vec(),
            cached_len: self.cached_len,
            pages: self.page_table(),
        }
    }

    fn decode_entry(&self) -> BatchEntry {
        let kv_len = self.kv_len();
        BatchEntry {
            request_id: self.id().clone(),
            tokens: self.tokens[kv_len..].to_vec(),
            cached_len: kv_len,
            pages: self.page_table(),
        }
    }
}

/// Request that left the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRequest {
    pub id: RequestId,
    /// `Completed` or `Aborted`
    pub state: RequestState,
    /// Generated tokens
    pub output: Vec<TokenId>,
}

/// Scheduler that orders admission by cached prefix length
#[derive(Debug)]
pub struct PrefixAwareScheduler {
    config: SchedulerConfig,
    tree: PrefixTree,
    allocator: Arc<dyn PageAllocator>,
    waiting: WaitingQueue,
    /// Tokens generated by queued requests before they were preempted
    resumed: HashMap<RequestId, Vec<TokenId>>,
    /// In-flight requests in admission order
    running: Vec<ScheduledRequest>,
    finished: Vec<FinishedRequest>,
    /// Counters; gauges are filled in by `metrics()`
    metrics: SchedulerMetrics,
}

impl PrefixAwareScheduler {
    /// Create a scheduler owning `tree`; pages come from the tree's allocator
    pub fn new(config: SchedulerConfig, tree: PrefixTree) -> Result<Self> {
        config.validate()?;
        info!(
            "Creating prefix-aware scheduler: policy={:?}, max_batch_size={}, max_tokens_cached={}",
            config.policy, config.max_batch_size, config.max_tokens_cached
        );

        Ok(Self {
            allocator: tree.allocator().clone(),
            waiting: WaitingQueue::new(config.max_waiting_requests),
            resumed: HashMap::new(),
            config,
            tree,
            running: Vec::new(),
            finished: Vec::new(),
            metrics: SchedulerMetrics::default(),
        })
    }

    /// Build the page pool, prefix tree and scheduler described by `config`
    pub fn from_config(config: &KvTreeConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(PagePool::from_config(&config.pool)?);
        let tree = PrefixTree::new(config.cache.clone(), pool)?;
        Self::new(config.scheduler.clone(), tree)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn tree(&self) -> &PrefixTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut PrefixTree {
        &mut self.tree
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    /// Current state of a request still known to the scheduler
    pub fn request_state(&self, id: &RequestId) -> Option<RequestState> {
        if self.waiting.contains(id) {
            return Some(RequestState::Queued);
        }
        if let Some(req) = self.running.iter().find(|r| r.id() == id) {
            return Some(req.state);
        }
        self.finished.iter().find(|f| &f.id == id).map(|f| f.state)
    }

    /// Hand over requests that completed or were aborted since the last call
    pub fn drain_finished(&mut self) -> Vec<FinishedRequest> {
        std::mem::take(&mut self.finished)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let mut metrics = self.metrics.clone();
        metrics.waiting_requests = self.waiting.len();
        metrics.prefilling_requests = self
            .running
            .iter()
            .filter(|r| r.state == RequestState::Prefilling)
            .count();
        metrics.decoding_requests = self
            .running
            .iter()
            .filter(|r| r.state == RequestState::Decoding)
            .count();
        metrics
    }

    /// Queue a request for admission
    pub fn submit(&mut self, request: Request) -> Result<RequestId> {
        if request.prompt.is_empty() {
            return Err(KvTreeError::invalid_parameter("Request prompt is empty"));
        }
        if request.max_new_tokens == 0 {
            return Err(KvTreeError::invalid_parameter(
                "Request must allow at least one new token",
            ));
        }

        let pages = (request.prompt.len() + 1).div_ceil(self.tree.page_size());
        if pages > self.allocator.capacity() {
            return Err(KvTreeError::invalid_parameter(format!(
                "Prompt of {} tokens needs {} pages, allocator holds {}",
                request.prompt.len(),
                pages,
                self.allocator.capacity()
            )));
        }

        let id = request.id.clone();
        let limit = self.config.max_waiting_requests;
        self.waiting.push(request).map_err(|rejected| {
            KvTreeError::scheduler(format!(
                "Waiting queue full ({} requests), rejected {}",
                limit, rejected.id
            ))
        })?;

        debug!("Submitted request {} ({} waiting)", id, self.waiting.len());
        Ok(id)
    }

    /// Admit waiting requests into a prefill batch.
    ///
    /// Under `Lpm` requests with longer cached prefixes go first; ties keep
    /// queue order. Requests over the remaining `max_tokens_cached` budget are
    /// skipped, except for the first admission of a tick. A request that still
    /// cannot get pages after one round of eviction stays queued and ends
    /// admission for this tick.
    pub fn build_prefill_batch(&mut self) -> Result<Batch> {
        if self.config.request_timeout().is_some() {
            self.abort_expired()?;
        }
        self.tree.enforce_capacity()?;

        let mut candidates: Vec<(RequestId, usize)> = self
            .waiting
            .iter()
            .map(|req| {
                let tokens = self.queued_tokens(req);
                (req.id.clone(), self.reusable_prefix(&tokens).matched_len)
            })
            .collect();
        if self.config.policy == SchedulePolicy::Lpm {
            candidates.sort_by(|a, b| b.1.cmp(&a.1));
        }

        let ps = self.tree.page_size();
        let mut budget = self.config.max_tokens_cached;
        let mut entries = Vec::new();

        for (id, _) in candidates {
            if entries.len() >= self.config.max_batch_size {
                break;
            }

            let tokens = match self.waiting.get(&id) {
                Some(req) => self.queued_tokens(req),
                None => continue,
            };
            // Earlier admissions may have evicted part of the first match
            let m = self.reusable_prefix(&tokens);
            let uncached = tokens.len() - m.matched_len;
            if uncached > budget && !entries.is_empty() {
                trace!(
                    "Skipping {}: {} uncached tokens, {} left in budget",
                    id,
                    uncached,
                    budget
                );
                continue;
            }

            self.tree.lock(m.last_node)?;
            let needed = (tokens.len() + 1 - m.matched_len).div_ceil(ps);
            let owned = match self.allocate_pages(needed)? {
                Some(pages) => pages,
                None => {
                    self.tree.unlock(m.last_node)?;
                    self.metrics.deferred += 1;
                    debug!(
                        "Deferring {}: needs {} pages, {} available",
                        id,
                        needed,
                        self.allocator.available()
                    );
                    break;
                }
            };
            if m.has_match() {
                self.tree.touch(m.last_node)?;
            }

            let request = self.waiting.remove(&id).ok_or_else(|| {
                KvTreeError::internal(format!("{} vanished from the waiting queue", id))
            })?;

            budget = budget.saturating_sub(uncached);
            if self.resumed.remove(&id).is_none() {
                self.metrics.admitted_requests += 1;
                self.metrics.prompt_tokens += tokens.len() as u64;
                self.metrics.cache_hit_tokens += m.matched_len as u64;
            }

            let scheduled = ScheduledRequest {
                request,
                state: RequestState::Prefilling,
                tokens,
                node: m.last_node,
                cached_len: m.matched_len,
                tree_pages: m.pages,
                owned_pages: owned,
                admitted_at: Utc::now(),
            };
            trace!(
                "Admitted {}: {} cached, {} to compute",
                id,
                scheduled.cached_len,
                uncached
            );
            entries.push(scheduled.prefill_entry());
            self.running.push(scheduled);
        }

        if !entries.is_empty() {
            self.metrics.prefill_batches += 1;
            debug!(
                "Prefill batch of {} requests, {} still waiting",
                entries.len(),
                self.waiting.len()
            );
        }
        Ok(Batch::new(BatchKind::Prefill, entries))
    }

    /// One step for every decoding request that has, or can get, room for
    /// another token.
    ///
    /// Requests are served in admission order. One that finds the pool dry
    /// after eviction preempts newer decoding requests until it gets a page;
    /// if none is left it sits this tick out. A request that is alone in
    /// flight and still cannot grow is completed with what it has.
    pub fn build_decode_batch(&mut self) -> Result<Batch> {
        let ps = self.tree.page_size();
        let mut entries = Vec::new();

        let mut idx = 0;
        while idx < self.running.len() {
            let req = &self.running[idx];
            if req.state != RequestState::Decoding {
                idx += 1;
                continue;
            }

            if req.tokens.len() + 1 > req.slots(ps) && !self.grow(idx)? {
                if self.running.len() == 1 {
                    warn!(
                        "{} cannot grow past {} tokens with the pool exhausted, completing it",
                        self.running[idx].id(),
                        self.running[idx].tokens.len()
                    );
                    self.finish(idx, RequestState::Completed)?;
                    continue;
                }
                self.metrics.deferred += 1;
                debug!("No page for {}, skipping this step", self.running[idx].id());
                idx += 1;
                continue;
            }

            entries.push(self.running[idx].decode_entry());
            idx += 1;
        }

        if !entries.is_empty() {
            self.metrics.decode_batches += 1;
            trace!("Decode batch of {} requests", entries.len());
        }
        Ok(Batch::new(BatchKind::Decode, entries))
    }

    /// Next batch to run: admissions take priority over decoding
    pub fn step(&mut self) -> Result<Batch> {
        let prefill = self.build_prefill_batch()?;
        if !prefill.is_empty() {
            return Ok(prefill);
        }
        self.build_decode_batch()
    }

    /// Fold model output back into request state and the prefix tree.
    ///
    /// Every result is checked before any is applied, so a rejected call
    /// leaves the scheduler as it was.
    pub fn on_batch_complete(&mut self, results: &[BatchResult]) -> Result<()> {
        self.check_results(results)?;

        for result in results {
            let idx = match self.running.iter().position(|r| r.id() == &result.request_id) {
                Some(idx) => idx,
                None => {
                    warn!(
                        "Dropping result for {}: not in flight",
                        result.request_id
                    );
                    continue;
                }
            };

            self.running[idx]
                .tokens
                .extend_from_slice(&result.new_tokens);
            self.commit(idx)?;

            let done = {
                let req = &self.running[idx];
                result.finished || req.output().len() >= req.request.max_new_tokens
            };
            if done {
                self.finish(idx, RequestState::Completed)?;
            } else {
                self.running[idx].state = RequestState::Decoding;
            }
        }

        self.tree.enforce_capacity()?;
        Ok(())
    }

    /// Cancel a request. Returns whether it was queued or in flight.
    ///
    /// Anything already committed to the tree stays cached.
    pub fn abort(&mut self, id: &RequestId) -> Result<bool> {
        if let Some(request) = self.waiting.remove(id) {
            info!("Aborted queued request {}", id);
            self.metrics.aborted_requests += 1;
            self.finished.push(FinishedRequest {
                output: self.resumed.remove(&request.id).unwrap_or_default(),
                id: request.id,
                state: RequestState::Aborted,
            });
            return Ok(true);
        }

        match self.running.iter().position(|r| r.id() == id) {
            Some(idx) => {
                info!("Aborted in-flight request {}", id);
                self.finish(idx, RequestState::Aborted)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Abort every request older than the configured timeout
    pub fn abort_expired(&mut self) -> Result<Vec<RequestId>> {
        let timeout = match self.config.request_timeout() {
            Some(timeout) => timeout,
            None => return Ok(Vec::new()),
        };
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| KvTreeError::config(format!("Request timeout out of range: {}", e)))?;
        let cutoff = Utc::now() - timeout;

        let expired: Vec<RequestId> = self
            .waiting
            .iter()
            .chain(self.running.iter().map(|r| &r.request))
            .filter(|req| req.created_at < cutoff)
            .map(|req| req.id.clone())
            .collect();

        for id in &expired {
            self.abort(id)?;
        }
        if !expired.is_empty() {
            warn!("Aborted {} expired requests", expired.len());
        }
        Ok(expired)
    }

    /// Prompt plus anything generated before a preemption
    fn queued_tokens(&self, request: &Request) -> Vec<TokenId> {
        let mut tokens = request.prompt.clone();
        if let Some(generated) = self.resumed.get(&request.id) {
            tokens.extend_from_slice(generated);
        }
        tokens
    }

    /// Prefix a queued request can reuse. The last token is always recomputed
    /// so the model has logits to sample from.
    fn reusable_prefix(&self, tokens: &[TokenId]) -> MatchResult {
        self.tree.match_prefix(&tokens[..tokens.len() - 1])
    }

    fn check_results(&self, results: &[BatchResult]) -> Result<()> {
        let ps = self.tree.page_size();
        let mut seen = HashSet::with_capacity(results.len());

        for result in results {
            if !seen.insert(&result.request_id) {
                return Err(KvTreeError::invalid_parameter(format!(
                    "{} reported more than once in one batch",
                    result.request_id
                )));
            }
            let req = match self.running.iter().find(|r| r.id() == &result.request_id) {
                Some(req) => req,
                None => continue,
            };

            if req.tokens.len() + result.new_tokens.len() > req.slots(ps) {
                return Err(KvTreeError::invalid_parameter(format!(
                    "{} returned {} tokens but only {} slots are reserved",
                    req.id(),
                    result.new_tokens.len(),
                    req.slots(ps) - req.tokens.len()
                )));
            }
            if result.new_tokens.is_empty() && !result.finished {
                return Err(KvTreeError::invalid_parameter(format!(
                    "{} returned no tokens without finishing",
                    req.id()
                )));
            }
        }
        Ok(())
    }

    /// Reserve one more page for `running[idx]`, preempting newer decoding
    /// requests while the pool stays dry. `false` when none is left to take.
    fn grow(&mut self, idx: usize) -> Result<bool> {
        loop {
            if let Some(pages) = self.allocate_pages(1)? {
                self.running[idx].owned_pages.extend(pages);
                return Ok(true);
            }

            let victim = (idx + 1..self.running.len())
                .rev()
                .find(|&i| self.running[i].state == RequestState::Decoding);
            match victim {
                Some(victim) => self.preempt(victim)?,
                None => return Ok(false),
            }
        }
    }

    /// Send an in-flight request back to the front of the queue. Its cached
    /// prefix stays in the tree, unlocked; the rest is recomputed on
    /// readmission.
    fn preempt(&mut self, idx: usize) -> Result<()> {
        // A sequence that could never be readmitted keeps what it has
        let pages = (self.running[idx].tokens.len() + 1).div_ceil(self.tree.page_size());
        if pages > self.allocator.capacity() {
            warn!(
                "{} is too long to requeue, completing it",
                self.running[idx].id()
            );
            return self.finish(idx, RequestState::Completed);
        }

        let req = self.running.remove(idx);
        self.tree.unlock(req.node)?;
        self.allocator.free(&req.owned_pages)?;
        self.metrics.preempted_requests += 1;
        info!(
            "Preempted {} after {} generated tokens",
            req.id(),
            req.output().len()
        );

        let generated = req.output().to_vec();
        self.resumed.insert(req.request.id.clone(), generated);
        self.waiting.push_front(req.request);
        Ok(())
    }

    /// Allocate, evicting the shortfall and retrying once on `OutOfMemory`.
    /// `None` means the pages are not available this tick.
    fn allocate_pages(&mut self, count: usize) -> Result<Option<Vec<PageId>>> {
        if count == 0 {
            return Ok(Some(Vec::new()));
        }

        match self.allocator.allocate(count) {
            Ok(pages) => return Ok(Some(pages)),
            Err(err) if err.is_retryable() => {}
            Err(err) => return Err(err),
        }

        let shortfall = count.saturating_sub(self.allocator.available());
        let freed = self.tree.evict(shortfall)?;
        debug!(
            "Out of pages: evicted {} of {} needed for {} pages",
            freed, shortfall, count
        );

        match self.allocator.allocate(count) {
            Ok(pages) => Ok(Some(pages)),
            Err(err) if err.is_retryable() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Cache every whole page of computed KV and move the request's lock to
    /// the node that now covers it
    fn commit(&mut self, idx: usize) -> Result<()> {
        if !self.tree.is_enabled() {
            return Ok(());
        }
        let ps = self.tree.page_size();

        let (tokens, pages, handed, old_node) = {
            let req = &self.running[idx];
            let aligned = req.kv_len() / ps * ps;
            if aligned <= req.cached_len {
                return Ok(());
            }

            let handed = (aligned - req.cached_len) / ps;
            let mut pages = req.tree_pages.clone();
            pages.extend_from_slice(&req.owned_pages[..handed]);
            (req.tokens[..aligned].to_vec(), pages, handed, req.node)
        };

        self.tree.insert(&tokens, &pages)?;
        // The tree holds these pages now, or has released them as duplicates
        self.running[idx].owned_pages.drain(..handed);
        let m = self.tree.match_prefix(&tokens);
        if m.matched_len != tokens.len() {
            return Err(KvTreeError::invariant_violation(format!(
                "committed {} tokens but only {} match",
                tokens.len(),
                m.matched_len
            )));
        }

        // Lock the new node before releasing the old one so the shared path
        // never becomes evictable in between
        self.tree.lock(m.last_node)?;
        self.tree.unlock(old_node)?;

        let req = &mut self.running[idx];
        trace!(
            "Committed {} tokens of {} ({} -> {})",
            tokens.len(),
            req.id(),
            old_node,
            m.last_node
        );
        req.node = m.last_node;
        req.cached_len = m.matched_len;
        req.tree_pages = m.pages;
        Ok(())
    }

    /// Release a request's lock and reserved pages and retire it
    fn finish(&mut self, idx: usize, state: RequestState) -> Result<()> {
        let mut req = self.running.remove(idx);
        self.tree.unlock(req.node)?;
        self.allocator.free(&req.owned_pages)?;
        req.owned_pages.clear();
        req.state = state;

        match state {
            RequestState::Completed => self.metrics.completed_requests += 1,
            _ => self.metrics.aborted_requests += 1,
        }
        debug!(
            "Request {} {:?} after {} tokens ({} ms in flight)",
            req.id(),
            state,
            req.output().len(),
            (Utc::now() - req.admitted_at).num_milliseconds()
        );

        self.finished.push(FinishedRequest {
            id: req.request.id.clone(),
            state,
            output: req.output().to_vec(),
        });
        Ok(())
    }
}
