// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The message tree (§3.2).
//!
//! Messages are stored in a dense arena keyed by a monotonic index; the
//! public `id` is a UUID so that ids remain stable across save/load and
//! branch/replace operations. `current_id` is the active leaf; walking
//! `parent_id` from it to a root (`parent_id = None`) is the active path.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, Role};

/// Persisted session metadata — first line of the on-disk log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default)]
    pub kv: HashMap<String, serde_json::Value>,
}

/// One line-delimited record in the on-disk session log.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogRecord {
    Meta(SessionMetadata),
    Message(Message),
}

/// The conversation tree plus token-budget accounting used by the context
/// manager (§4.8). Every mutation goes through `&mut self` — the Session is
/// owned by a single task (see `supervision.rs`) so no internal locking is
/// needed.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    arena: Vec<Message>,
    index: HashMap<String, usize>,
    pub current_id: Option<String>,
    metadata: HashMap<String, serde_json::Value>,

    /// Append-only log path; `None` disables persistence.
    persist_path: Option<std::path::PathBuf>,

    // ── Token-budget accounting (§4.8) ──────────────────────────────────
    /// Calibrated estimate of the entire active path, in tokens.
    pub token_count: usize,
    /// Model's maximum input context window.
    pub max_tokens: usize,
    /// Model's maximum output tokens (reserved out of the budget).
    pub max_output_tokens: usize,
    /// Estimated tokens for tool schemas + dynamic context not stored in the tree.
    pub schema_overhead: usize,
    /// Multiplier correcting the ~4-chars/token heuristic against the last
    /// reported provider usage. Starts at 1.0 (pure heuristic).
    pub calibration_factor: f32,
    /// Last prompt_tokens reported by the provider, or 0 if none yet.
    pub last_prompt_tokens: usize,
    pub cache_read_total: u64,
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            arena: Vec::new(),
            index: HashMap::new(),
            current_id: None,
            metadata: HashMap::new(),
            persist_path: None,
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            last_prompt_tokens: 0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    pub fn with_persistence(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    /// Attach (or change) the persistence path of an already-built session,
    /// e.g. once the supervisor knows the session id it minted and can derive
    /// a deterministic file name from it.
    pub fn set_persist_path(&mut self, path: impl Into<std::path::PathBuf>) {
        self.persist_path = Some(path.into());
    }

    /// Override the freshly-minted id with a caller-supplied one. Used by
    /// `SessionSupervisor::start_session` when `SessionSpec::session_id` is
    /// set, so the caller can know the session's id before the session
    /// exists — e.g. to pre-register a `task` tool whose sub-agent events
    /// must be republished on the parent's topic.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    // ── Tree operations (§4.2) ──────────────────────────────────────────

    /// Append a message below `current_id`, assigning it an id and making it
    /// the new active leaf. Best-effort persists the record to disk.
    pub fn append(&mut self, mut msg: Message) -> String {
        let id = Uuid::new_v4().to_string();
        msg.id = id.clone();
        msg.parent_id = self.current_id.clone();
        self.token_count += msg.approx_tokens();
        if let Err(e) = self.persist_append(&msg) {
            tracing::warn!(error = %e, "session log append failed; continuing in-memory only");
        }
        let idx = self.arena.len();
        self.arena.push(msg);
        self.index.insert(id.clone(), idx);
        self.current_id = Some(id.clone());
        id
    }

    pub fn append_many(&mut self, msgs: impl IntoIterator<Item = Message>) -> Vec<String> {
        msgs.into_iter().map(|m| self.append(m)).collect()
    }

    fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.arena[i])
    }

    /// Invariant S1/S2: walk `current_id` to the root and return root→leaf.
    pub fn get_path(&self) -> Vec<Message> {
        let Some(mut cursor) = self.current_id.clone() else {
            return Vec::new();
        };
        let mut rev = Vec::new();
        loop {
            let Some(m) = self.get(&cursor) else {
                // A dangling pointer would violate S1; treat as path end
                // rather than panicking, since this can only happen after
                // an external corruption of the arena.
                break;
            };
            rev.push(m.clone());
            match &m.parent_id {
                Some(p) => cursor = p.clone(),
                None => break,
            }
        }
        rev.reverse();
        rev
    }

    /// Fork the tree: subsequent `append` calls attach below `target_id`.
    pub fn branch(&mut self, target_id: &str) -> anyhow::Result<()> {
        if !self.index.contains_key(target_id) {
            bail!("branch target {target_id} not found in session");
        }
        self.current_id = Some(target_id.to_string());
        Ok(())
    }

    /// Compaction primitive (§4.2, §4.8 step 4): remove the contiguous
    /// segment `from_id..=to_id` on the *active path*, splice in
    /// `replacements`, and re-parent any children of `to_id` (elsewhere in
    /// the tree, e.g. an abandoned branch) onto the last replacement.
    ///
    /// `from_id` must be an ancestor of (or equal to) `to_id` on the active
    /// path. Returns the id of the new path head (the last replacement, or
    /// `to_id`'s parent if `replacements` is empty).
    pub fn replace_path_segment(
        &mut self,
        from_id: &str,
        to_id: &str,
        replacements: Vec<Message>,
    ) -> anyhow::Result<String> {
        let path = self.get_path();
        let from_pos = path.iter().position(|m| m.id == from_id)
            .context("replace_path_segment: from_id not on active path")?;
        let to_pos = path.iter().position(|m| m.id == to_id)
            .context("replace_path_segment: to_id not on active path")?;
        if from_pos > to_pos {
            bail!("replace_path_segment: from_id must precede to_id on the active path");
        }

        let tail_after_to = &path[to_pos + 1..];
        let new_parent = path.get(from_pos.wrapping_sub(1)).map(|m| m.id.clone());
        // `from_pos == 0` means we're replacing from the root: new_parent is None.
        let new_parent = if from_pos == 0 { None } else { new_parent };

        // Splice in replacements, re-parenting the chain.
        let mut cursor = new_parent;
        let mut last_id = cursor.clone();
        for mut r in replacements {
            let id = Uuid::new_v4().to_string();
            r.id = id.clone();
            r.parent_id = cursor.clone();
            let idx = self.arena.len();
            self.arena.push(r.clone());
            self.index.insert(id.clone(), idx);
            cursor = Some(id.clone());
            last_id = Some(id);
            let _ = self.persist_append(&r);
        }

        // Re-attach the remainder of the active path (everything after
        // `to_id`) under the new head.
        let mut reattach_parent = last_id.clone();
        for m in tail_after_to {
            if let Some(&idx) = self.index.get(&m.id) {
                self.arena[idx].parent_id = reattach_parent.clone();
            }
            reattach_parent = Some(m.id.clone());
        }

        // Re-parent any other (off-path) children of `to_id` — e.g. an
        // abandoned branch point inside the removed segment — onto the new
        // head so S1 is preserved for the whole tree, not just the active path.
        let removed_ids: std::collections::HashSet<&str> =
            path[from_pos..=to_pos].iter().map(|m| m.id.as_str()).collect();
        for m in self.arena.iter_mut() {
            if let Some(p) = &m.parent_id {
                if removed_ids.contains(p.as_str()) && !removed_ids.contains(m.id.as_str()) {
                    m.parent_id = last_id.clone();
                }
            }
        }

        self.current_id = if tail_after_to.is_empty() {
            last_id.clone()
        } else {
            self.current_id.clone()
        };

        self.recalculate_tokens();
        Ok(last_id.unwrap_or_default())
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    // ── Token accounting ─────────────────────────────────────────────────

    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.get_path().iter().map(|m| m.approx_tokens()).sum();
    }

    /// Usable input budget: context window minus the output reservation.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    pub fn context_fraction(&self) -> f32 {
        let budget = self.input_budget();
        if budget == 0 {
            return 0.0;
        }
        let effective = ((self.token_count as f32) * self.calibration_factor) as usize + self.schema_overhead;
        effective as f32 / budget as f32
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Update the calibration factor from a real provider usage report:
    /// `actual` prompt tokens vs. our `estimated` heuristic count.
    pub fn update_calibration(&mut self, actual: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        self.last_prompt_tokens = actual as usize;
        let ratio = actual as f32 / estimated as f32;
        // Exponential moving average so a single noisy report can't swing
        // the estimate wildly.
        self.calibration_factor = self.calibration_factor * 0.7 + ratio * 0.3;
    }

    pub fn add_cache_usage(&mut self, read: u32, write: u32) {
        self.cache_read_total += read as u64;
        self.cache_write_total += write as u64;
    }

    // ── Persistence (§4.2, §6.4) ─────────────────────────────────────────

    fn persist_append(&self, msg: &Message) -> anyhow::Result<()> {
        let Some(path) = &self.persist_path else { return Ok(()) };
        let is_new = !path.exists();
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening session log {}", path.display()))?;
        if is_new {
            let meta = SessionMetadata { session_id: self.id.clone(), kv: HashMap::new() };
            writeln!(f, "{}", serde_json::to_string(&LogRecord::Meta(meta))?)?;
        }
        writeln!(f, "{}", serde_json::to_string(&LogRecord::Message(msg.clone()))?)?;
        Ok(())
    }

    /// Serialise the full tree plus metadata to `path` via atomic rename.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let mut buf = String::new();
        let meta = SessionMetadata { session_id: self.id.clone(), kv: self.metadata.clone() };
        buf.push_str(&serde_json::to_string(&LogRecord::Meta(meta))?);
        buf.push('\n');
        for m in &self.arena {
            buf.push_str(&serde_json::to_string(&LogRecord::Message(m.clone()))?);
            buf.push('\n');
        }
        std::fs::write(&tmp, buf).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    /// Reconstruct a session from a line-delimited log. `current_id` is set
    /// to the leaf of the longest root-terminated path found in the file.
    pub fn load(path: impl AsRef<Path>, max_tokens: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut session = Session::new(max_tokens);
        let mut children: HashMap<Option<String>, Vec<String>> = HashMap::new();

        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed record", path.display(), lineno + 1))?;
            match record {
                LogRecord::Meta(m) => {
                    session.id = m.session_id;
                    session.metadata = m.kv;
                }
                LogRecord::Message(m) => {
                    children.entry(m.parent_id.clone()).or_default().push(m.id.clone());
                    let idx = session.arena.len();
                    session.index.insert(m.id.clone(), idx);
                    session.arena.push(m);
                }
            }
        }

        // Find the longest chain from any root (parent_id = None).
        let roots = children.get(&None).cloned().unwrap_or_default();
        let mut best: Option<String> = None;
        let mut best_len = 0usize;
        for root in roots {
            let (leaf, len) = session.deepest_leaf(&root, &children, 1);
            if len > best_len {
                best_len = len;
                best = Some(leaf);
            }
        }
        session.current_id = best;
        session.recalculate_tokens();
        Ok(session)
    }

    fn deepest_leaf(
        &self,
        node: &str,
        children: &HashMap<Option<String>, Vec<String>>,
        depth: usize,
    ) -> (String, usize) {
        match children.get(&Some(node.to_string())) {
            Some(kids) if !kids.is_empty() => {
                let mut best = (node.to_string(), depth);
                for k in kids {
                    let candidate = self.deepest_leaf(k, children, depth + 1);
                    if candidate.1 > best.1 {
                        best = candidate;
                    }
                }
                best
            }
            _ => (node.to_string(), depth),
        }
    }

    /// Validate S1 (every non-root parent resolves) — used in tests and as
    /// a defensive check after `replace_path_segment`.
    pub fn check_tree_integrity(&self) -> anyhow::Result<()> {
        for m in &self.arena {
            if let Some(p) = &m.parent_id {
                if !self.index.contains_key(p) {
                    bail!("tree integrity violated: {} has dangling parent {}", m.id, p);
                }
            }
        }
        Ok(())
    }

    pub fn system_message(&self) -> Option<Message> {
        self.get_path().into_iter().find(|m| m.role == Role::System)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_parent_and_advances_current() {
        let mut s = Session::new(1000);
        let a = s.append(Message::user("hi"));
        let b = s.append(Message::assistant("hello"));
        assert_eq!(s.current_id.as_deref(), Some(b.as_str()));
        assert_eq!(s.get(&b).unwrap().parent_id.as_deref(), Some(a.as_str()));
    }

    #[test]
    fn get_path_terminates_at_root() {
        let mut s = Session::new(1000);
        s.append(Message::user("1"));
        s.append(Message::assistant("2"));
        s.append(Message::user("3"));
        let path = s.get_path();
        assert_eq!(path.len(), 3);
        assert!(path[0].parent_id.is_none());
    }

    #[test]
    fn branching_forks_without_losing_old_branch() {
        let mut s = Session::new(1000);
        let m1 = s.append(Message::user("m1"));
        let m2 = s.append(Message::assistant("m2"));
        s.append(Message::user("m3"));
        s.append(Message::assistant("m4"));

        s.branch(&m2).unwrap();
        s.append(Message::user("alt"));
        let path = s.get_path();
        assert_eq!(path.len(), 3);
        assert_eq!(path.last().unwrap().content, "alt");
        // Old branch still resolvable by id even though it's not active.
        assert!(s.get(&m1).is_some());
    }

    #[test]
    fn replace_path_segment_splices_in_summary() {
        let mut s = Session::new(1000);
        let m1 = s.append(Message::user("old1"));
        s.append(Message::assistant("old2"));
        let m3 = s.append(Message::user("old3"));
        s.append(Message::assistant("recent"));

        s.replace_path_segment(&m1, &m3, vec![Message::user("[summary]")]).unwrap();
        let path = s.get_path();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].content, "[summary]");
        assert_eq!(path[1].content, "recent");
        s.check_tree_integrity().unwrap();
    }

    #[test]
    fn replace_path_segment_reparents_orphaned_branch() {
        let mut s = Session::new(1000);
        let m1 = s.append(Message::user("old1"));
        let branch_point = s.append(Message::assistant("old2"));
        let main_leaf = s.append(Message::user("old3"));

        // Fork off an abandoned branch at branch_point, then return to the
        // main path so `main_leaf` is active again.
        s.branch(&branch_point).unwrap();
        let abandoned = s.append(Message::user("abandoned-branch"));
        s.branch(&main_leaf).unwrap();
        s.append(Message::assistant("recent"));

        s.replace_path_segment(&m1, &branch_point, vec![Message::user("[summary]")]).unwrap();
        let abandoned_msg = s.get(&abandoned).unwrap();
        assert!(abandoned_msg.parent_id.is_some());
        s.check_tree_integrity().unwrap();
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let mut s = Session::new(1000);
        s.append(Message::system("sys"));
        s.append(Message::user("hi"));
        s.append(Message::assistant("hello"));
        s.set_metadata("title", serde_json::json!("test"));
        s.save(&path).unwrap();

        let loaded = Session::load(&path, 1000).unwrap();
        assert_eq!(loaded.get_path().len(), s.get_path().len());
        assert_eq!(loaded.current_id, s.current_id);
        assert_eq!(loaded.get_metadata("title"), s.get_metadata("title"));
    }

    #[test]
    fn calibration_updates_with_usage() {
        let mut s = Session::new(1000);
        s.append(Message::user("12345678901234567890")); // 20 chars -> 5 tokens est
        let estimated = s.token_count;
        s.update_calibration(10, estimated);
        assert!(s.calibration_factor < 1.0);
    }
}
