//! # Return Address Estimation
//!
//! Guesses where in memory the return address of the active frame is stored.
//!
//! For code that follows the calling conventions this is the frame pointer plus one pointer
//! width, but plenty of code does not. So the static return sites of the current function are
//! used instead: each site yields a candidate location computed from the live registers.
//!
//! The frame pointer based candidate is preferred, since it does not depend on how much the
//! stack grew since function entry. The stack pointer based candidate is a last resort: when a
//! function aligns its stack to more than the pointer width, the number of bytes the alignment
//! removed can not be known statically and the result is off.
//!
//! When a function has several return sites that disagree, the first one wins. That is a
//! heuristic, and it is reported as such through [`Estimate::Ambiguous`].

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::addr::Addr;
use crate::analysis::{FunctionInfo, ReturnSite, StaticAnalysis};

/// The live register values the estimation works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveFrame {
    pub ip: Addr,
    pub sp: Addr,
    pub fp: Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    /// No known function contains the instruction pointer
    UnresolvedFunction,
    /// The function has no return site with usable static information
    NoReturnSites,
}

/// Outcome of [`estimate_return_slot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimate {
    /// All return sites agree
    Exact(Addr),
    /// The return sites disagree, `chosen` is the first candidate in enumeration order
    Ambiguous { chosen: Addr, candidates: Vec<Addr> },
    Unknown(UnknownReason),
}

impl Estimate {
    /// The estimated location, if there is one
    pub fn location(&self) -> Option<Addr> {
        match self {
            Estimate::Exact(a) => Some(*a),
            Estimate::Ambiguous { chosen, .. } => Some(*chosen),
            Estimate::Unknown(_) => None,
        }
    }

    /// The estimated location, or the frame pointer plus one pointer width
    pub fn location_or_fallback(&self, frame: &LiveFrame, pointer_width: usize) -> Option<Addr> {
        self.location()
            .or_else(|| frame.fp.checked_offset(pointer_width as i64))
    }
}

/// The location a single return site implies, `None` if the site has no static information
/// or the arithmetic leaves the address space
pub fn candidate_for(site: &ReturnSite, frame: &LiveFrame) -> Option<Addr> {
    if let Some(frame_offset) = site.frame_offset {
        return frame.fp.checked_offset(frame_offset.checked_neg()?);
    }
    if let Some(delta) = site.stack_delta {
        // unreliable if the function realigned its stack
        return frame.sp.checked_offset(delta.checked_neg()?);
    }
    debug!(
        "return site at {} has no static stack information",
        site.address
    );
    None
}

/// Estimates the return address slot for a known function
pub fn estimate_for_function(func: &FunctionInfo, frame: &LiveFrame) -> Estimate {
    let mut candidates: Vec<Addr> = Vec::new();
    for site in &func.return_sites {
        let Some(candidate) = candidate_for(site, frame) else {
            continue;
        };
        trace!(
            "return site {} puts the return address at {candidate}",
            site.address
        );
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }

    match candidates.len() {
        0 => Estimate::Unknown(UnknownReason::NoReturnSites),
        1 => Estimate::Exact(candidates[0]),
        _ => {
            warn!(
                "function {} has multiple possible return addresses: {candidates:?}",
                func.name
            );
            Estimate::Ambiguous {
                chosen: candidates[0],
                candidates,
            }
        }
    }
}

/// Estimates the return address slot of the function containing the instruction pointer
pub fn estimate_return_slot(analysis: &dyn StaticAnalysis, frame: &LiveFrame) -> Estimate {
    match analysis.function_at(frame.ip) {
        Some(func) => estimate_for_function(&func, frame),
        None => {
            debug!("no function contains {}", frame.ip);
            Estimate::Unknown(UnknownReason::UnresolvedFunction)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn func(sites: Vec<ReturnSite>) -> FunctionInfo {
        FunctionInfo {
            name: "f".to_string(),
            start: Addr::new(0x1000),
            end: Addr::new(0x1100),
            return_sites: sites,
        }
    }

    fn fp_site(address: u64, offset: i64) -> ReturnSite {
        ReturnSite {
            address: Addr::new(address),
            frame_offset: Some(offset),
            stack_delta: None,
        }
    }

    fn sp_site(address: u64, delta: i64) -> ReturnSite {
        ReturnSite {
            address: Addr::new(address),
            frame_offset: None,
            stack_delta: Some(delta),
        }
    }

    const FRAME: LiveFrame = LiveFrame {
        ip: Addr::new(0x1010),
        sp: Addr::new(0x1f00),
        fp: Addr::new(0x2000),
    };

    #[test]
    fn test_frame_pointer_candidate() {
        let est = estimate_for_function(&func(vec![fp_site(0x10f0, 0x20)]), &FRAME);
        assert_eq!(est, Estimate::Exact(Addr::new(0x1fe0)));
    }

    #[test]
    fn test_stack_pointer_fallback() {
        let est = estimate_for_function(&func(vec![sp_site(0x10f0, 0x18)]), &FRAME);
        assert_eq!(est, Estimate::Exact(Addr::new(0x1ee8)));
    }

    #[test]
    fn test_frame_pointer_is_preferred() {
        let site = ReturnSite {
            address: Addr::new(0x10f0),
            frame_offset: Some(-8),
            stack_delta: Some(0x100),
        };
        assert_eq!(candidate_for(&site, &FRAME), Some(Addr::new(0x2008)));
    }

    #[test]
    fn test_identical_candidates_are_not_ambiguous() {
        let est = estimate_for_function(
            &func(vec![fp_site(0x10f0, 0x20), fp_site(0x10a0, 0x20)]),
            &FRAME,
        );
        assert_eq!(est, Estimate::Exact(Addr::new(0x1fe0)));
    }

    #[test]
    fn test_ambiguity_picks_first() {
        let sites = vec![fp_site(0x10f0, 0x20), sp_site(0x10a0, 0x10)];
        let est = estimate_for_function(&func(sites), &FRAME);
        assert_eq!(
            est,
            Estimate::Ambiguous {
                chosen: Addr::new(0x1fe0),
                candidates: vec![Addr::new(0x1fe0), Addr::new(0x1ef0)],
            }
        );
        assert_eq!(est.location(), Some(Addr::new(0x1fe0)));
    }

    #[test]
    fn test_estimate_is_deterministic() {
        let f = func(vec![sp_site(0x10a0, 0x10), fp_site(0x10f0, 0x20)]);
        let first = estimate_for_function(&f, &FRAME);
        for _ in 0..10 {
            assert_eq!(estimate_for_function(&f, &FRAME), first);
        }
        assert_eq!(first.location(), Some(Addr::new(0x1ef0)));
    }

    #[test]
    fn test_no_return_sites() {
        let est = estimate_for_function(&func(vec![]), &FRAME);
        assert_eq!(est, Estimate::Unknown(UnknownReason::NoReturnSites));
        assert_eq!(est.location_or_fallback(&FRAME, 8), Some(Addr::new(0x2008)));

        let useless = ReturnSite {
            address: Addr::new(0x10f0),
            frame_offset: None,
            stack_delta: None,
        };
        assert_eq!(
            estimate_for_function(&func(vec![useless]), &FRAME),
            Estimate::Unknown(UnknownReason::NoReturnSites)
        );
    }

    #[test]
    fn test_overflow_is_skipped() {
        let low = LiveFrame {
            ip: Addr::new(0x1010),
            sp: Addr::new(0x8),
            fp: Addr::new(0x10),
        };
        let est = estimate_for_function(&func(vec![fp_site(0x10f0, 0x20)]), &low);
        assert_eq!(est, Estimate::Unknown(UnknownReason::NoReturnSites));
    }

    #[test]
    fn test_unresolved_function() {
        let flow: crate::analysis::ControlFlowFile =
            serde_json::from_str(r#"{"arch": "x86_64", "functions": []}"#).unwrap();
        let model = crate::analysis::StaticModel::from_control_flow("t", flow).unwrap();
        assert_eq!(
            estimate_return_slot(&model, &FRAME),
            Estimate::Unknown(UnknownReason::UnresolvedFunction)
        );
    }
}
