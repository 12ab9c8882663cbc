//! Session bookkeeping shared across scans.
//!
//! `SessionContext` is the explicit replacement for a global run-metadata
//! map. It exposes only the keys the plans read and write: the running scan
//! id, the facility cycle, the data session, and the scan ids of the most
//! recent dark and flat acquisitions for downstream linkage.
//!
//! A session is created once when the instrument session starts. Persisting
//! it between processes is the caller's job (it is `serde`-serializable).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Cycle label used for commissioning proposals.
pub const COMMISSIONING_CYCLE: &str = "commissioning";

/// Kind of frames a scan produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Shutter closed.
    Dark,
    /// Sample out of the beam.
    Flat,
    /// Tomography projections.
    Projection,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Dark => write!(f, "dark"),
            FrameType::Flat => write!(f, "flat"),
            FrameType::Projection => write!(f, "proj"),
        }
    }
}

/// Proposal category, which decides the cycle directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    /// Regular user proposal.
    #[default]
    User,
    /// Beamline commissioning.
    Commissioning,
}

/// Mutable per-session bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    scan_id: u64,
    cycle: String,
    data_session: String,
    proposal_type: ProposalType,
    last_dark_scan_id: Option<u64>,
    last_flat_scan_id: Option<u64>,
}

impl SessionContext {
    /// Start a session. `scan_id` is the id of the last completed scan.
    pub fn new(
        scan_id: u64,
        cycle: impl Into<String>,
        data_session: impl Into<String>,
        proposal_type: ProposalType,
    ) -> Self {
        Self {
            scan_id,
            cycle: cycle.into(),
            data_session: data_session.into(),
            proposal_type,
            last_dark_scan_id: None,
            last_flat_scan_id: None,
        }
    }

    /// Id of the most recently started scan.
    pub fn scan_id(&self) -> u64 {
        self.scan_id
    }

    /// Advance to and return the next scan id.
    pub fn next_scan_id(&mut self) -> u64 {
        self.scan_id += 1;
        self.scan_id
    }

    /// Facility cycle directory, `commissioning` for commissioning proposals.
    pub fn cycle(&self) -> &str {
        match self.proposal_type {
            ProposalType::Commissioning => COMMISSIONING_CYCLE,
            ProposalType::User => &self.cycle,
        }
    }

    /// Data session identifier, e.g. `pass-313941`.
    pub fn data_session(&self) -> &str {
        &self.data_session
    }

    /// Proposal category.
    pub fn proposal_type(&self) -> ProposalType {
        self.proposal_type
    }

    /// Scan id of the most recent dark acquisition.
    pub fn last_dark_scan_id(&self) -> Option<u64> {
        self.last_dark_scan_id
    }

    /// Scan id of the most recent flat acquisition.
    pub fn last_flat_scan_id(&self) -> Option<u64> {
        self.last_flat_scan_id
    }

    /// Remember `scan_id` as the latest calibration of `frame_type`.
    ///
    /// Projection scans are not calibrations and are ignored.
    pub fn record_calibration(&mut self, frame_type: FrameType, scan_id: u64) {
        match frame_type {
            FrameType::Dark => self.last_dark_scan_id = Some(scan_id),
            FrameType::Flat => self.last_flat_scan_id = Some(scan_id),
            FrameType::Projection => {}
        }
    }

    /// Label used for per-scan directories.
    pub fn scan_label(scan_id: u64) -> String {
        format!("scan_{:05}", scan_id)
    }

    /// Resource directory for `frame_type` frames of `scan_id`.
    ///
    /// Dark and flat frames share one directory next to the projections.
    pub fn resource_dir(scan_id: u64, frame_type: FrameType) -> PathBuf {
        match frame_type {
            FrameType::Projection => PathBuf::from(Self::scan_label(scan_id)),
            FrameType::Dark | FrameType::Flat => {
                PathBuf::from(format!("{}_dark_flat", Self::scan_label(scan_id)))
            }
        }
    }

    /// Unique file prefix for `frame_type` frames.
    pub fn file_prefix(frame_type: FrameType) -> String {
        match frame_type {
            FrameType::Projection => Uuid::new_v4().to_string(),
            other => format!("{}_{}", other, Uuid::new_v4()),
        }
    }
}
