use std::sync::atomic::{AtomicBool, Ordering};

use loc_core::cfg::PermissionsCfg;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    ForegroundLocation,
    BackgroundLocation,
}

/// Host permission model. Only queried, never prompted from here.
pub trait PermissionGate: Send + Sync {
    fn has_permission(&self, kind: PermissionKind) -> bool;
}

/// Grants fixed at startup (from config), adjustable at runtime.
#[derive(Debug)]
pub struct StaticGate {
    foreground: AtomicBool,
    background: AtomicBool,
}

impl StaticGate {
    pub fn new(foreground: bool, background: bool) -> Self {
        Self { foreground: AtomicBool::new(foreground), background: AtomicBool::new(background) }
    }

    pub fn from_cfg(cfg: &PermissionsCfg) -> Self {
        Self::new(cfg.foreground_location, cfg.background_location)
    }

    pub fn set(&self, kind: PermissionKind, granted: bool) {
        self.flag(kind).store(granted, Ordering::SeqCst);
    }

    fn flag(&self, kind: PermissionKind) -> &AtomicBool {
        match kind {
            PermissionKind::ForegroundLocation => &self.foreground,
            PermissionKind::BackgroundLocation => &self.background,
        }
    }
}

impl PermissionGate for StaticGate {
    fn has_permission(&self, kind: PermissionKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }
}
