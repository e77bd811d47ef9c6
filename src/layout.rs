//! Pane pool and grid presets.
//!
//! A fixed pool of `MAX_PANES` slots is created once. Switching presets only
//! changes which slots are visible and in what order; a pane that drops out of
//! view is hidden and keeps its session running.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::PaneDefaults;
use crate::error::{GridError, Result};
use crate::persist::{PersistedLayout, SCHEMA_VERSION};
use crate::session::{CreateOptions, SessionSnapshot};
use crate::supervisor::{Created, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: &'static str,
    pub rows: usize,
    pub columns: usize,
}

impl Preset {
    pub const fn panel_count(&self) -> usize {
        self.rows * self.columns
    }
}

pub static PRESETS: [Preset; 6] = [
    Preset { id: "1x1", rows: 1, columns: 1 },
    Preset { id: "1x2", rows: 1, columns: 2 },
    Preset { id: "2x2", rows: 2, columns: 2 },
    Preset { id: "2x3", rows: 2, columns: 3 },
    Preset { id: "2x4", rows: 2, columns: 4 },
    Preset { id: "3x4", rows: 3, columns: 4 },
];

/// Largest `panel_count` in the catalog; the size of the pane pool.
pub const MAX_PANES: usize = 12;

pub fn preset(id: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.id == id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneState {
    Visible,
    Hidden,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pane {
    pub id: String,
    pub slot_index: usize,
    /// Rank under the active preset. Hidden panes keep their last rank so they
    /// come back in the same order.
    pub position_index: Option<usize>,
    pub group_id: Option<String>,
    pub state: PaneState,
    pub session_id: Option<String>,
}

impl Pane {
    fn new(slot: usize) -> Self {
        Self {
            id: format!("pane-{slot}"),
            slot_index: slot,
            position_index: None,
            group_id: None,
            state: PaneState::Terminated,
            session_id: None,
        }
    }

    fn show_at(&mut self, position: usize, columns: usize) {
        self.state = PaneState::Visible;
        self.position_index = Some(position);
        self.group_id = Some(format!("row-{}", position / columns.max(1)));
    }

    fn hide(&mut self) {
        self.state = PaneState::Hidden;
        self.group_id = None;
    }

    fn terminate(&mut self) {
        self.state = PaneState::Terminated;
        self.position_index = None;
        self.group_id = None;
        self.session_id = None;
    }

    /// Sort key for "best pane to bring back": last rank, then slot.
    fn recall_key(&self) -> (usize, usize) {
        (self.position_index.unwrap_or(usize::MAX), self.slot_index)
    }
}

/// Relative grid track sizes, one entry per row and per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRatios {
    pub rows: Vec<f64>,
    pub columns: Vec<f64>,
}

impl TrackRatios {
    fn fits(&self, preset: &Preset) -> bool {
        self.rows.len() == preset.rows
            && self.columns.len() == preset.columns
            && self
                .rows
                .iter()
                .chain(&self.columns)
                .all(|r| r.is_finite() && *r > 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSnapshot {
    pub preset_id: String,
    pub panes: Vec<Pane>,
    pub track_ratios: Option<TrackRatios>,
}

impl LayoutSnapshot {
    pub fn visible(&self) -> Vec<&Pane> {
        let mut panes: Vec<&Pane> = self.panes.iter().filter(|p| p.state == PaneState::Visible).collect();
        panes.sort_by_key(|p| p.position_index);
        panes
    }

    pub fn pane(&self, pane_id: &str) -> Option<&Pane> {
        self.panes.iter().find(|p| p.id == pane_id)
    }
}

/// Layout plus the capability tokens a client needs for its panes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutView {
    pub layout: LayoutSnapshot,
    pub grants: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    /// Sessions reattached rather than started fresh.
    pub restored: Vec<String>,
    pub layout: LayoutSnapshot,
    pub grants: HashMap<String, String>,
}

struct LayoutState {
    preset: &'static Preset,
    panes: Vec<Pane>,
    track_ratios: Option<TrackRatios>,
}

impl LayoutState {
    fn snapshot(&self) -> LayoutSnapshot {
        LayoutSnapshot {
            preset_id: self.preset.id.to_string(),
            panes: self.panes.clone(),
            track_ratios: self.track_ratios.clone(),
        }
    }

    fn index_of(&self, pane_id: &str) -> Result<usize> {
        self.panes
            .iter()
            .position(|p| p.id == pane_id)
            .ok_or_else(|| GridError::Layout(format!("unknown pane {pane_id:?}")))
    }
}

fn tier(state: PaneState) -> u8 {
    match state {
        PaneState::Visible => 0,
        PaneState::Hidden => 1,
        PaneState::Terminated => 2,
    }
}

/// Slots in promotion priority: preferred, visible by rank, hidden by last
/// rank, terminated by slot. No duplicates.
fn candidate_order(panes: &[Pane], preferred_slots: &[usize]) -> Vec<usize> {
    let mut visible: Vec<&Pane> = panes.iter().filter(|p| p.state == PaneState::Visible).collect();
    visible.sort_by_key(|p| p.recall_key());
    let mut hidden: Vec<&Pane> = panes.iter().filter(|p| p.state == PaneState::Hidden).collect();
    hidden.sort_by_key(|p| p.recall_key());
    let terminated = panes.iter().filter(|p| p.state == PaneState::Terminated);

    let mut order: Vec<usize> = Vec::with_capacity(panes.len());
    for slot in preferred_slots
        .iter()
        .copied()
        .chain(visible.into_iter().map(|p| p.slot_index))
        .chain(hidden.into_iter().map(|p| p.slot_index))
        .chain(terminated.map(|p| p.slot_index))
    {
        if !order.contains(&slot) {
            order.push(slot);
        }
    }
    order
}

pub struct LayoutOrchestrator {
    supervisor: Supervisor,
    template: PaneDefaults,
    default_preset: &'static Preset,
    // One lock for the whole pool; layout operations run one at a time.
    state: Mutex<LayoutState>,
}

impl LayoutOrchestrator {
    pub fn new(supervisor: Supervisor, template: PaneDefaults, default_preset: &str) -> Result<Self> {
        let default_preset =
            preset(default_preset).ok_or_else(|| GridError::Layout(format!("unknown preset {default_preset:?}")))?;
        Ok(Self {
            supervisor,
            template,
            default_preset,
            state: Mutex::new(LayoutState {
                preset: default_preset,
                panes: (0..MAX_PANES).map(Pane::new).collect(),
                track_ratios: None,
            }),
        })
    }

    /// Fill the default preset with sessions.
    pub fn start(&self) -> Result<LayoutView> {
        self.set_preset(self.default_preset.id, &[], 0)
    }

    pub fn snapshot(&self) -> LayoutSnapshot {
        self.state.lock().snapshot()
    }

    fn template_options(&self) -> CreateOptions {
        CreateOptions {
            cwd: self.template.cwd.clone().filter(|p| p.is_dir()),
            command: self.template.command.clone(),
            persistent: self.template.persistent,
            auto_restart: self.template.auto_restart,
            ..CreateOptions::default()
        }
    }

    /// Give `pane` a live session if it lacks one. Failures leave it empty.
    fn ensure_session(&self, pane: &mut Pane, grants: &mut HashMap<String, String>) {
        if pane.session_id.as_deref().is_some_and(|id| self.supervisor.is_live(id)) {
            return;
        }
        match self.supervisor.create(self.template_options()) {
            Ok(created) => {
                pane.session_id = Some(created.session.id.clone());
                grants.insert(created.session.id, created.capability_token);
            }
            Err(e) => {
                tracing::warn!(pane = %pane.id, error = %e, "could not start session for pane");
                pane.session_id = None;
            }
        }
    }

    pub fn set_preset(&self, preset_id: &str, preferred: &[String], min_panel_count: usize) -> Result<LayoutView> {
        let target = preset(preset_id).ok_or_else(|| GridError::Layout(format!("unknown preset {preset_id:?}")))?;
        let panel_count = target.panel_count();
        let mut state = self.state.lock();

        let mut preferred_slots: Vec<usize> = Vec::new();
        for id in preferred {
            if let Some(pane) = state.panes.iter().find(|p| p.session_id.as_deref() == Some(id.as_str())) {
                if !preferred_slots.contains(&pane.slot_index) {
                    preferred_slots.push(pane.slot_index);
                }
            }
        }
        let required = min_panel_count.max(preferred_slots.len());
        if required > panel_count {
            return Err(GridError::Layout(format!(
                "preset {} shows {panel_count} panes but {required} must stay visible",
                target.id
            )));
        }

        let chosen: Vec<usize> = candidate_order(&state.panes, &preferred_slots)
            .into_iter()
            .take(panel_count)
            .collect();
        let mut ranked = chosen.clone();
        ranked.sort_by_key(|&slot| {
            let pane = &state.panes[slot];
            (tier(pane.state), pane.position_index.unwrap_or(usize::MAX), slot)
        });

        for pane in state.panes.iter_mut() {
            if pane.state == PaneState::Visible && !chosen.contains(&pane.slot_index) {
                pane.hide();
            }
        }
        for (rank, &slot) in ranked.iter().enumerate() {
            state.panes[slot].show_at(rank, target.columns);
        }
        state.preset = target;
        if state.track_ratios.as_ref().is_some_and(|r| !r.fits(target)) {
            state.track_ratios = None;
        }

        let mut grants = HashMap::new();
        for &slot in &ranked {
            self.ensure_session(&mut state.panes[slot], &mut grants);
        }
        tracing::info!(preset = target.id, created = grants.len(), "preset applied");
        Ok(LayoutView {
            layout: state.snapshot(),
            grants,
        })
    }

    /// Bring a hidden or terminated pane into view at `position` (default: the
    /// last rank). The pane currently there is hidden.
    pub fn show_pane(&self, pane_id: &str, position: Option<usize>) -> Result<LayoutView> {
        let mut state = self.state.lock();
        let idx = state.index_of(pane_id)?;
        let mut grants = HashMap::new();
        if state.panes[idx].state == PaneState::Visible {
            return Ok(LayoutView {
                layout: state.snapshot(),
                grants,
            });
        }

        let panel_count = state.preset.panel_count();
        let target = position.unwrap_or(panel_count - 1);
        if target >= panel_count {
            return Err(GridError::Layout(format!(
                "position {target} is outside preset {}",
                state.preset.id
            )));
        }
        if let Some(displaced) = state
            .panes
            .iter()
            .position(|p| p.state == PaneState::Visible && p.position_index == Some(target))
        {
            state.panes[displaced].hide();
        }
        let columns = state.preset.columns;
        state.panes[idx].show_at(target, columns);
        self.ensure_session(&mut state.panes[idx], &mut grants);
        Ok(LayoutView {
            layout: state.snapshot(),
            grants,
        })
    }

    /// Kill the pane's session and retire the pane. A visible pane is replaced
    /// in place so the preset stays full.
    pub fn terminate_pane(&self, pane_id: &str) -> Result<LayoutView> {
        let mut state = self.state.lock();
        let idx = state.index_of(pane_id)?;
        let vacated = match state.panes[idx].state {
            PaneState::Visible => state.panes[idx].position_index,
            _ => None,
        };
        if let Some(session_id) = state.panes[idx].session_id.clone() {
            if let Some(outcome) = self.supervisor.kill_unchecked(&session_id, "pane terminated") {
                tracing::info!(pane = %pane_id, session_id = %session_id, status = ?outcome.status, "pane session killed");
            }
        }
        state.panes[idx].terminate();

        let mut grants = HashMap::new();
        if let Some(position) = vacated {
            let mut hidden: Vec<&Pane> = state.panes.iter().filter(|p| p.state == PaneState::Hidden).collect();
            hidden.sort_by_key(|p| p.recall_key());
            let replacement = hidden
                .first()
                .map(|p| p.slot_index)
                .or_else(|| {
                    state
                        .panes
                        .iter()
                        .find(|p| p.state == PaneState::Terminated && p.slot_index != idx)
                        .map(|p| p.slot_index)
                })
                .unwrap_or(idx);
            let columns = state.preset.columns;
            state.panes[replacement].show_at(position, columns);
            self.ensure_session(&mut state.panes[replacement], &mut grants);
        }
        Ok(LayoutView {
            layout: state.snapshot(),
            grants,
        })
    }

    pub fn set_track_ratios(&self, rows: Vec<f64>, columns: Vec<f64>) -> Result<LayoutSnapshot> {
        let mut state = self.state.lock();
        let ratios = TrackRatios { rows, columns };
        if !ratios.fits(state.preset) {
            return Err(GridError::Layout(format!(
                "track ratios do not fit preset {}",
                state.preset.id
            )));
        }
        state.track_ratios = Some(ratios);
        Ok(state.snapshot())
    }

    /// Layout for a (re)connecting client, with fresh tokens for every bound
    /// live session. Earlier tokens for those sessions stop working.
    pub fn view_for_client(&self) -> LayoutView {
        let state = self.state.lock();
        let mut grants = HashMap::new();
        for id in state.panes.iter().filter_map(|p| p.session_id.as_ref()) {
            if let Some(token) = self.supervisor.reissue_token(id) {
                grants.insert(id.clone(), token);
            }
        }
        LayoutView {
            layout: state.snapshot(),
            grants,
        }
    }

    pub fn persisted(&self) -> PersistedLayout {
        let state = self.state.lock();
        let sessions: Vec<SessionSnapshot> = state
            .panes
            .iter()
            .filter_map(|p| p.session_id.as_deref())
            .filter_map(|id| self.supervisor.snapshot(id))
            .collect();
        PersistedLayout {
            schema_version: SCHEMA_VERSION,
            preset_id: state.preset.id.to_string(),
            panes: state.panes.clone(),
            sessions,
            track_ratios: state.track_ratios.clone(),
        }
    }

    fn start_fresh_like(&self, snapshot: &SessionSnapshot) -> Option<Created> {
        let mut opts = CreateOptions::from_snapshot(snapshot);
        if !snapshot.cwd.is_dir() {
            opts.cwd = None;
        }
        match self.supervisor.create(opts) {
            Ok(created) => Some(created),
            Err(e) => {
                tracing::warn!(session_id = %snapshot.id, error = %e, "could not restart persisted session");
                None
            }
        }
    }

    /// Replace the current layout and sessions with `doc`. Only visible panes
    /// keep their sessions; each is reattached when its backend survived and
    /// started fresh otherwise.
    pub fn restore_layout(&self, doc: &PersistedLayout) -> Result<RestoreOutcome> {
        if doc.schema_version != SCHEMA_VERSION {
            return Err(GridError::Layout(format!(
                "unsupported layout schema {}",
                doc.schema_version
            )));
        }
        let target =
            preset(&doc.preset_id).ok_or_else(|| GridError::Layout(format!("unknown preset {:?}", doc.preset_id)))?;
        let panel_count = target.panel_count();
        let mut state = self.state.lock();

        let mut panes: Vec<Pane> = (0..MAX_PANES).map(Pane::new).collect();
        let mut seen = HashSet::new();
        for saved in &doc.panes {
            if saved.slot_index >= MAX_PANES || !seen.insert(saved.slot_index) {
                continue;
            }
            if saved.state == PaneState::Visible {
                let pane = &mut panes[saved.slot_index];
                pane.state = PaneState::Visible;
                pane.position_index = saved.position_index;
                pane.session_id = saved.session_id.clone();
            }
        }

        let mut visible: Vec<usize> = panes
            .iter()
            .filter(|p| p.state == PaneState::Visible)
            .map(|p| p.slot_index)
            .collect();
        visible.sort_by_key(|&slot| panes[slot].recall_key());
        for &slot in visible.iter().skip(panel_count) {
            panes[slot].hide();
            panes[slot].session_id = None;
        }
        visible.truncate(panel_count);
        for slot in 0..MAX_PANES {
            if visible.len() >= panel_count {
                break;
            }
            if panes[slot].state == PaneState::Terminated {
                visible.push(slot);
            }
        }
        for (rank, &slot) in visible.iter().enumerate() {
            panes[slot].show_at(rank, target.columns);
        }

        let recoverable: HashSet<String> = visible
            .iter()
            .filter_map(|&slot| panes[slot].session_id.clone())
            .filter(|id| doc.session(id).is_some_and(|s| s.persistent))
            .collect();
        for live in self.supervisor.list().into_iter().filter(|s| !s.status.is_terminal()) {
            if live.persistent && recoverable.contains(&live.id) {
                self.supervisor.detach(&live.id);
            } else {
                self.supervisor.kill_unchecked(&live.id, "layout restore");
            }
        }

        let mut restored = Vec::new();
        let mut grants = HashMap::new();
        for &slot in &visible {
            let saved = panes[slot].session_id.as_deref().and_then(|id| doc.session(id));
            let created = match saved {
                Some(snapshot) => match self.supervisor.recover(snapshot) {
                    Ok(created) => {
                        restored.push(created.session.id.clone());
                        Some(created)
                    }
                    Err(e) => {
                        tracing::info!(session_id = %snapshot.id, error = %e, "recovery failed, starting fresh");
                        self.start_fresh_like(snapshot)
                    }
                },
                None => None,
            };
            match created {
                Some(created) => {
                    panes[slot].session_id = Some(created.session.id.clone());
                    grants.insert(created.session.id, created.capability_token);
                }
                None => {
                    panes[slot].session_id = None;
                    self.ensure_session(&mut panes[slot], &mut grants);
                }
            }
        }

        state.preset = target;
        state.panes = panes;
        state.track_ratios = doc.track_ratios.clone().filter(|r| r.fits(target));
        tracing::info!(preset = target.id, restored = restored.len(), "layout restored");
        Ok(RestoreOutcome {
            restored,
            layout: state.snapshot(),
            grants,
        })
    }
}
