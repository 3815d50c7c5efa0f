//! Request intake matching: filter eligible caregivers and rank them by
//! region affinity and declared availability. Read-only and deterministic.

use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::calendar::TimeWindow;

pub const REGION_MATCH: u32 = 2;
pub const POSTAL_PREFIX_MATCH: u32 = 1;
pub const AVAILABILITY_BONUS: u32 = 1;
const POSTAL_PREFIX_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRequest {
    pub service: String,
    pub date: NaiveDate,
    pub window: Option<TimeWindow>,
    /// Resolved start minute: an explicit time, else the window's start.
    pub start_minute: Option<u16>,
    pub postal_code: Option<String>,
    pub region: Option<String>,
}

/// What the engine knows about one caregiver, already parsed into typed lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub caregiver_id: Ulid,
    pub approved: bool,
    pub active: bool,
    pub services: Vec<String>,
    pub region: Option<String>,
    pub work_regions: Vec<String>,
    pub postal_code: Option<String>,
    pub available_on_date: bool,
    /// Some declared slot on the date covers the requested start minute.
    pub covers_start: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedCandidate {
    pub caregiver_id: Ulid,
    pub score: u32,
    pub reasons: Vec<String>,
}

pub fn is_eligible(c: &Candidate, service: &str) -> bool {
    c.approved && c.active && c.services.iter().any(|s| s.eq_ignore_ascii_case(service))
}

fn same_region(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn normalize_postal(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Region affinity in `{0, 1, 2}` plus the reason for it.
pub fn region_score(c: &Candidate, req: &MatchRequest) -> (u32, Option<String>) {
    if let Some(target) = req.region.as_deref().filter(|r| !r.trim().is_empty()) {
        if c.region.as_deref().is_some_and(|r| same_region(r, target)) {
            return (REGION_MATCH, Some(format!("serves region {target}")));
        }
        if c.work_regions.iter().any(|r| same_region(r, target)) {
            return (REGION_MATCH, Some(format!("also works in {target}")));
        }
        return (0, None);
    }

    let (Some(theirs), Some(ours)) = (c.postal_code.as_deref(), req.postal_code.as_deref()) else {
        return (0, None);
    };
    let (theirs, ours) = (normalize_postal(theirs), normalize_postal(ours));
    if theirs.is_empty() || ours.is_empty() {
        return (0, None);
    }
    if theirs == ours {
        return (REGION_MATCH, Some("same postal code".to_string()));
    }
    if theirs.chars().count() >= POSTAL_PREFIX_LEN
        && ours.chars().count() >= POSTAL_PREFIX_LEN
        && theirs.chars().take(POSTAL_PREFIX_LEN).eq(ours.chars().take(POSTAL_PREFIX_LEN))
    {
        return (POSTAL_PREFIX_MATCH, Some("nearby postal area".to_string()));
    }
    (0, None)
}

/// Score every eligible candidate and order by descending score.
///
/// `candidates` must already be in registration order; ties keep that order.
pub fn rank(candidates: &[Candidate], req: &MatchRequest) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .iter()
        .filter(|c| is_eligible(c, &req.service))
        .filter_map(|c| {
            let (region, region_reason) = region_score(c, req);
            let bonus = if c.available_on_date { AVAILABILITY_BONUS } else { 0 };
            let score = region * 2 + bonus;
            if score == 0 {
                return None;
            }
            let mut reasons: Vec<String> = region_reason.into_iter().collect();
            if c.available_on_date {
                reasons.push(format!("available on {}", req.date));
            }
            if c.covers_start {
                let when = req.window.map_or("the requested time", TimeWindow::as_str);
                reasons.push(format!("has a slot covering {when}"));
            }
            Some(RankedCandidate {
                caregiver_id: c.caregiver_id,
                score,
                reasons,
            })
        })
        .collect();
    // Stable: equal scores stay in registration order.
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked
}
