use std::cmp::Ordering;

use mdns_proto::{Entry, RecordData};

/// Outcome of comparing a locally-owned record against one observed on the
/// wire for the same name and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No conflict: the incoming record agrees with ours, or belongs to
    /// someone else entirely.
    NoConflict,
    /// The incoming record disagrees with ours and wins the tie-break — we
    /// must rename and, if probing, revert to PROBING_1.
    Lose,
    /// The incoming record disagrees with ours but we win — ignore it.
    Win,
}

/// RFC 6762 section 9.2 tie-break: compare canonical wire form, numerically
/// greater wins. Antisymmetric and irreflexive for distinct records.
fn tiebreak(ours: &Entry, theirs: &Entry) -> Verdict {
    match ours.tiebreak_cmp(theirs) {
        Ordering::Less => Verdict::Lose,
        Ordering::Greater => Verdict::Win,
        Ordering::Equal => Verdict::NoConflict,
    }
}

/// Address (A/AAAA) conflict handling for a probe or response carrying the
/// same (name, type) as one of our own records but a different payload.
pub fn handle_address(ours: &Entry, observed: &Entry) -> Verdict {
    if ours.record_type() != observed.record_type() || !ours.name.eq_ignore_ascii_case(&observed.name) {
        return Verdict::NoConflict;
    }
    if ours.data == observed.data {
        return Verdict::NoConflict;
    }
    tiebreak(ours, observed)
}

/// SRV query conflict handling: identical `(priority, weight, port, target)`
/// to our own means the query is our own echo reflected back on another
/// interface, not a genuine conflict.
pub fn handle_service(ours: &Entry, observed: &Entry) -> Verdict {
    if ours.record_type() != observed.record_type() || !ours.name.eq_ignore_ascii_case(&observed.name) {
        return Verdict::NoConflict;
    }
    if let (
        RecordData::Service { priority: p1, weight: w1, port: port1, target: t1 },
        RecordData::Service { priority: p2, weight: w2, port: port2, target: t2 },
    ) = (&ours.data, &observed.data)
    {
        if p1 == p2 && w1 == w2 && port1 == port2 && t1.eq_ignore_ascii_case(t2) {
            return Verdict::NoConflict;
        }
    }
    tiebreak(ours, observed)
}

/// HINFO carries no authority semantics: informational only, per the
/// decided open question that its conflict hooks are genuine no-ops.
pub fn handle_host_information(_ours: &Entry, _observed: &Entry) -> Verdict {
    Verdict::NoConflict
}
