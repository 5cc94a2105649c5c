//! Target resolution
//!
//! [`TargetState`] holds the process-wide explicit selection together with an
//! epoch that moves on every change. Operations that must not outlive a
//! target switch capture the epoch first and call [`TargetState::check`]
//! right before taking effect.
//!
//! [`TargetResolver`] answers "where am I operating" with a strict fallback
//! chain: explicit selection, session mapping, default project root, focused
//! pane, process cwd. The first applicable source wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mux::{focused_pane, Multiplexer, PaneInfo};

/// A concrete pane to operate on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub session_id: String,
    pub window_index: u32,
    pub pane_index: u32,
    pub pane_id: String,
    pub working_directory: PathBuf,
}

impl Target {
    pub fn from_pane(pane: &PaneInfo) -> Self {
        Self {
            session_id: pane.session_name.clone(),
            window_index: pane.window_index,
            pane_index: pane.pane_index,
            pane_id: pane.pane_id.clone(),
            working_directory: pane.current_path.clone(),
        }
    }

    /// `window:pane`, for display only
    pub fn display_id(&self) -> String {
        format!("{}:{}", self.window_index, self.pane_index)
    }
}

/// The explicit selection plus its epoch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveTarget {
    pub target: Option<Target>,
    pub epoch: u64,
}

/// Shared, epoch-tagged selection
#[derive(Debug, Default)]
pub struct TargetState {
    inner: RwLock<ActiveTarget>,
}

impl TargetState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> ActiveTarget {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).epoch
    }

    pub fn selected(&self) -> Option<Target> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .target
            .clone()
    }

    /// Fails with `EpochChanged` if the selection moved since `captured`
    pub fn check(&self, captured: u64) -> Result<()> {
        let current = self.epoch();
        if current != captured {
            return Err(Error::EpochChanged { captured, current });
        }
        Ok(())
    }

    /// Replace the selection; returns the new epoch
    pub fn select(&self, target: Target) -> u64 {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.target = Some(target);
        guard.epoch += 1;
        guard.epoch
    }

    /// Drop the selection if there is one; returns the new epoch
    pub fn clear(&self) -> Option<u64> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.target.take()?;
        guard.epoch += 1;
        Some(guard.epoch)
    }

    /// Drop the selection only if it still points at `pane_id`
    pub fn clear_if(&self, pane_id: &str) -> Option<u64> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match &guard.target {
            Some(t) if t.pane_id == pane_id => {
                guard.target = None;
                guard.epoch += 1;
                Some(guard.epoch)
            }
            _ => None,
        }
    }

    /// Update the cwd of the selected pane; does not move the epoch
    pub fn refresh_working_directory(&self, pane_id: &str, cwd: PathBuf) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = guard.target.as_mut() {
            if t.pane_id == pane_id {
                t.working_directory = cwd;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Explicit,
    SessionMapping,
    DefaultRoot,
    FocusedPane,
    ProcessCwd,
}

/// Outcome of one resolution pass
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub working_directory: PathBuf,
    pub source: ResolutionSource,
    /// Pane the relay attaches to: the selection, else the focused pane
    pub target: Option<Target>,
    pub epoch: u64,
}

/// One row of the target listing
#[derive(Debug, Clone, Serialize)]
pub struct TargetListing {
    #[serde(flatten)]
    pub target: Target,
    pub display_id: String,
    pub current_command: String,
    pub focused: bool,
    pub selected: bool,
}

pub struct TargetResolver {
    mux: Arc<dyn Multiplexer>,
    session_dirs: HashMap<String, PathBuf>,
    default_root: Option<PathBuf>,
}

impl TargetResolver {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        session_dirs: HashMap<String, PathBuf>,
        default_root: Option<PathBuf>,
    ) -> Self {
        Self {
            mux,
            session_dirs,
            default_root,
        }
    }

    pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.mux
    }

    pub async fn list_targets(&self, state: &TargetState) -> Result<Vec<TargetListing>> {
        let panes = self.mux.list_panes().await?;
        let focused_id = focused_pane(&panes).map(|p| p.pane_id.clone());
        let selected_id = state.selected().map(|t| t.pane_id);
        Ok(panes
            .iter()
            .map(|p| {
                let target = Target::from_pane(p);
                TargetListing {
                    display_id: target.display_id(),
                    current_command: p.current_command.clone(),
                    focused: focused_id.as_deref() == Some(p.pane_id.as_str()),
                    selected: selected_id.as_deref() == Some(p.pane_id.as_str()),
                    target,
                }
            })
            .collect())
    }

    /// Make `pane_id` the explicit target. A pane that no longer exists is
    /// a stale target, never a fallback.
    pub async fn select(&self, state: &TargetState, pane_id: &str) -> Result<(Target, u64)> {
        let panes = self.mux.list_panes().await?;
        let pane = panes
            .iter()
            .find(|p| p.pane_id == pane_id)
            .ok_or_else(|| Error::StaleTarget {
                pane_id: pane_id.to_string(),
            })?;
        let target = Target::from_pane(pane);
        let epoch = state.select(target.clone());
        info!(pane_id, epoch, session = %target.session_id, "Target selected");
        Ok((target, epoch))
    }

    /// Run the fallback chain
    pub async fn resolve(&self, state: &TargetState) -> Result<Resolution> {
        let active = state.snapshot();
        let panes = self.mux.list_panes().await?;

        if let Some(selected) = active.target {
            return match panes.iter().find(|p| p.pane_id == selected.pane_id) {
                Some(pane) => {
                    state.refresh_working_directory(&pane.pane_id, pane.current_path.clone());
                    let target = Target::from_pane(pane);
                    Ok(Resolution {
                        working_directory: target.working_directory.clone(),
                        source: ResolutionSource::Explicit,
                        target: Some(target),
                        epoch: active.epoch,
                    })
                }
                None => {
                    let epoch = state.clear_if(&selected.pane_id);
                    warn!(pane_id = %selected.pane_id, ?epoch, "Selected target disappeared");
                    Err(Error::StaleTarget {
                        pane_id: selected.pane_id,
                    })
                }
            };
        }

        let focused = focused_pane(&panes);
        let target = focused.map(Target::from_pane);

        let (working_directory, source) = if let Some(dir) =
            focused.and_then(|p| self.session_dirs.get(&p.session_name))
        {
            (dir.clone(), ResolutionSource::SessionMapping)
        } else if let Some(root) = &self.default_root {
            (root.clone(), ResolutionSource::DefaultRoot)
        } else if let Some(pane) = focused {
            (pane.current_path.clone(), ResolutionSource::FocusedPane)
        } else {
            (std::env::current_dir()?, ResolutionSource::ProcessCwd)
        };

        debug!(?source, cwd = %working_directory.display(), "Resolved working directory");
        Ok(Resolution {
            working_directory,
            source,
            target,
            epoch: active.epoch,
        })
    }

    /// Pane the relay should attach to
    pub async fn attach_target(&self, state: &TargetState) -> Result<(Target, u64)> {
        let resolution = self.resolve(state).await?;
        match resolution.target {
            Some(target) => Ok((target, resolution.epoch)),
            None => Err(Error::NoTarget("no pane selected or focused".to_string())),
        }
    }

    /// Reject requests aimed at a pane other than the current one
    pub async fn require_current(&self, state: &TargetState, pane_id: &str) -> Result<(Target, u64)> {
        let (current, epoch) = self.attach_target(state).await?;
        if current.pane_id != pane_id {
            return Err(Error::TargetMismatch {
                expected: current.pane_id,
                received: pane_id.to_string(),
            });
        }
        Ok((current, epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::fake::{pane, FakeMux};

    fn setup() -> (Arc<FakeMux>, TargetResolver, Arc<TargetState>) {
        let mux = Arc::new(FakeMux::with_panes(vec![
            pane("api", 0, 0, "%1", "/srv/api"),
            pane("api", 0, 1, "%2", "/srv/api/sub"),
            pane("web", 1, 0, "%3", "/srv/web"),
        ]));
        mux.focus("%1");
        let resolver = TargetResolver::new(mux.clone(), HashMap::new(), None);
        (mux, resolver, TargetState::new())
    }

    #[tokio::test]
    async fn test_selection_is_sticky_across_focus_changes() {
        let (mux, resolver, state) = setup();
        let (_, epoch) = resolver.select(&state, "%3").await.unwrap();
        assert_eq!(epoch, 1);

        mux.focus("%2");
        let resolution = resolver.resolve(&state).await.unwrap();
        assert_eq!(resolution.source, ResolutionSource::Explicit);
        assert_eq!(resolution.target.unwrap().pane_id, "%3");
        assert_eq!(resolution.working_directory, PathBuf::from("/srv/web"));
    }

    #[tokio::test]
    async fn test_selecting_destroyed_pane_is_stale() {
        let (mux, resolver, state) = setup();
        mux.remove("%3");
        let err = resolver.select(&state, "%3").await.unwrap_err();
        assert!(matches!(err, Error::StaleTarget { ref pane_id } if pane_id == "%3"));
        assert_eq!(state.epoch(), 0);
        assert!(state.selected().is_none());
    }

    #[tokio::test]
    async fn test_dead_selection_is_cleared_once() {
        let (mux, resolver, state) = setup();
        resolver.select(&state, "%2").await.unwrap();
        mux.remove("%2");

        let err = resolver.resolve(&state).await.unwrap_err();
        assert!(matches!(err, Error::StaleTarget { .. }));
        assert_eq!(state.epoch(), 2);

        let resolution = resolver.resolve(&state).await.unwrap();
        assert_eq!(resolution.source, ResolutionSource::FocusedPane);
        assert_eq!(resolution.target.unwrap().pane_id, "%1");
    }

    #[tokio::test]
    async fn test_fallback_chain_order() {
        let mux = Arc::new(FakeMux::with_panes(vec![pane("api", 0, 0, "%1", "/pane/cwd")]));
        mux.focus("%1");

        let mut dirs = HashMap::new();
        dirs.insert("api".to_string(), PathBuf::from("/mapped/api"));
        let state = TargetState::new();

        let resolver = TargetResolver::new(mux.clone(), dirs.clone(), Some(PathBuf::from("/root/default")));
        let r = resolver.resolve(&state).await.unwrap();
        assert_eq!(r.source, ResolutionSource::SessionMapping);
        assert_eq!(r.working_directory, PathBuf::from("/mapped/api"));

        let resolver = TargetResolver::new(mux.clone(), HashMap::new(), Some(PathBuf::from("/root/default")));
        let r = resolver.resolve(&state).await.unwrap();
        assert_eq!(r.source, ResolutionSource::DefaultRoot);

        let resolver = TargetResolver::new(mux.clone(), HashMap::new(), None);
        let r = resolver.resolve(&state).await.unwrap();
        assert_eq!(r.source, ResolutionSource::FocusedPane);
        assert_eq!(r.working_directory, PathBuf::from("/pane/cwd"));

        let empty = Arc::new(FakeMux::default());
        let resolver = TargetResolver::new(empty, HashMap::new(), None);
        let r = resolver.resolve(&state).await.unwrap();
        assert_eq!(r.source, ResolutionSource::ProcessCwd);
        assert!(r.target.is_none());
    }

    #[tokio::test]
    async fn test_require_current_reports_both_sides() {
        let (_mux, resolver, state) = setup();
        resolver.select(&state, "%2").await.unwrap();
        let err = resolver.require_current(&state, "%3").await.unwrap_err();
        match err {
            Error::TargetMismatch { expected, received } => {
                assert_eq!(expected, "%2");
                assert_eq!(received, "%3");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(resolver.require_current(&state, "%2").await.is_ok());
    }

    #[test]
    fn test_epoch_check() {
        let state = TargetState::default();
        let captured = state.epoch();
        assert!(state.check(captured).is_ok());
        state.select(Target {
            session_id: "s".into(),
            window_index: 0,
            pane_index: 0,
            pane_id: "%1".into(),
            working_directory: PathBuf::from("/"),
        });
        assert!(matches!(
            state.check(captured),
            Err(Error::EpochChanged { captured: 0, current: 1 })
        ));
        assert_eq!(state.clear_if("%9"), None);
        assert_eq!(state.clear(), Some(2));
        assert_eq!(state.clear(), None);
    }
}
