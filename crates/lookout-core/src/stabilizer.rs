//! Temporal smoothing of per-frame identity decisions.
//!
//! Detections are associated to tracks by greedy IoU. Each track keeps the
//! last K match observations and shows the majority identity once it has
//! seen K of them. Tracks live in an arena keyed by stable integer ids.

use crate::matcher::{MatchResult, UNKNOWN_LABEL};
use crate::types::BoundingBox;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};

pub type TrackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Fewer than K observations; label suppressed.
    Provisional,
    /// Label shown; identity is the majority over the last K observations.
    Stable,
}

#[derive(Debug, Clone)]
pub struct StabilizerConfig {
    /// Observations required before a label is shown (K).
    pub window: usize,
    /// Frames a track may go unseen before it is dropped.
    pub expiry_frames: u32,
    /// Minimum IoU for a detection to continue an existing track.
    pub min_overlap: f32,
}

/// One face in the current frame, already matched against the gallery.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub result: MatchResult,
}

#[derive(Debug, Clone)]
struct Vote {
    /// `None` for rejected or ambiguous matches.
    identity: Option<String>,
    similarity: f32,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BoundingBox,
    pub state: TrackState,
    /// Identity currently winning the vote; `None` means unknown.
    pub provisional_identity: Option<String>,
    /// Mean similarity of the votes behind the current identity.
    pub confidence: f32,
    /// Frames since the track was created.
    pub age: u64,
    pub frames_since_seen: u32,
    history: VecDeque<Vote>,
}

impl Track {
    fn new(id: TrackId, bbox: BoundingBox) -> Self {
        Self {
            id,
            bbox,
            state: TrackState::Provisional,
            provisional_identity: None,
            confidence: 0.0,
            age: 0,
            frames_since_seen: 0,
            history: VecDeque::new(),
        }
    }

    fn observe(&mut self, bbox: BoundingBox, result: &MatchResult, window: usize) {
        self.bbox = bbox;
        self.frames_since_seen = 0;

        let identity = if result.is_match && !result.ambiguous {
            result.identity.clone()
        } else {
            None
        };
        self.history.push_back(Vote {
            identity,
            similarity: result.similarity,
        });
        while self.history.len() > window {
            self.history.pop_front();
        }

        if self.history.len() >= window {
            self.state = TrackState::Stable;
        }
        self.tally();
    }

    /// Recompute identity and confidence from the vote window.
    fn tally(&mut self) {
        let total = self.history.len();
        if total == 0 {
            return;
        }

        let mut counts: BTreeMap<Option<&str>, (usize, f32)> = BTreeMap::new();
        for vote in &self.history {
            let entry = counts.entry(vote.identity.as_deref()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += vote.similarity;
        }

        let mut winner: Option<(Option<&str>, usize, f32)> = None;
        for (identity, (count, sum)) in counts {
            let mean = sum / count as f32;
            let better = match winner {
                None => true,
                Some((_, best_count, best_mean)) => {
                    count > best_count || (count == best_count && mean > best_mean)
                }
            };
            if better {
                winner = Some((identity, count, mean));
            }
        }

        match winner {
            Some((identity, count, mean)) if count * 2 > total => {
                self.provisional_identity = identity.map(str::to_string);
                self.confidence = mean;
            }
            _ => {
                self.provisional_identity = None;
                self.confidence =
                    self.history.iter().map(|v| v.similarity).sum::<f32>() / total as f32;
            }
        }
    }

    fn output(&self, detection_index: Option<usize>) -> TrackOutput {
        let stable = self.state == TrackState::Stable;
        TrackOutput {
            track_id: self.id,
            bbox: self.bbox,
            state: self.state,
            label: stable.then(|| {
                self.provisional_identity
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
            }),
            identity: if stable { self.provisional_identity.clone() } else { None },
            confidence: self.confidence,
            is_match: stable && self.provisional_identity.is_some(),
            frames_since_seen: self.frames_since_seen,
            detection_index,
        }
    }
}

/// Display state of one live track after a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackOutput {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub state: TrackState,
    /// `None` while provisional.
    pub label: Option<String>,
    pub identity: Option<String>,
    pub confidence: f32,
    pub is_match: bool,
    /// 0 when the track was observed this frame.
    pub frames_since_seen: u32,
    /// Index into this frame's observations, when observed.
    #[serde(skip)]
    pub detection_index: Option<usize>,
}

/// Everything that changed in one frame.
#[derive(Debug, Clone, Default)]
pub struct StabilizerUpdate {
    /// Live tracks in id order.
    pub tracks: Vec<TrackOutput>,
    pub created: Vec<TrackId>,
    pub expired: Vec<TrackId>,
}

pub struct TrackStabilizer {
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
    config: StabilizerConfig,
}

impl TrackStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            config: StabilizerConfig {
                window: config.window.max(1),
                ..config
            },
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Advance one frame with this frame's observations (in detection order).
    pub fn update(&mut self, observations: &[FaceObservation]) -> StabilizerUpdate {
        let window = self.config.window;
        let mut update = StabilizerUpdate::default();

        let candidates: Vec<(TrackId, BoundingBox)> =
            self.tracks.values().map(|t| (t.id, t.bbox)).collect();
        let boxes: Vec<BoundingBox> = observations.iter().map(|o| o.bbox).collect();
        let matches = greedy_match(&candidates, &boxes, self.config.min_overlap);

        let mut seen: BTreeMap<TrackId, usize> = BTreeMap::new();
        let mut used_dets = HashSet::new();
        for (track_id, det_idx) in matches {
            if let Some(track) = self.tracks.get_mut(&track_id) {
                let obs = &observations[det_idx];
                track.observe(obs.bbox, &obs.result, window);
                seen.insert(track_id, det_idx);
                used_dets.insert(det_idx);
            }
        }

        for track in self.tracks.values_mut() {
            track.age += 1;
            if !seen.contains_key(&track.id) {
                track.frames_since_seen += 1;
            }
        }

        for (det_idx, obs) in observations.iter().enumerate() {
            if used_dets.contains(&det_idx) {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut track = Track::new(id, obs.bbox);
            track.observe(obs.bbox, &obs.result, window);
            self.tracks.insert(id, track);
            seen.insert(id, det_idx);
            update.created.push(id);
        }

        let expiry = self.config.expiry_frames;
        self.tracks.retain(|id, track| {
            let keep = track.frames_since_seen <= expiry;
            if !keep {
                update.expired.push(*id);
            }
            keep
        });

        update.tracks = self
            .tracks
            .values()
            .map(|t| t.output(seen.get(&t.id).copied()))
            .collect();

        if !update.created.is_empty() || !update.expired.is_empty() {
            tracing::debug!(
                created = ?update.created,
                expired = ?update.expired,
                live = self.tracks.len(),
                "track set changed"
            );
        }
        update
    }
}

/// Greedy IoU matching: pairs sorted by descending IoU, each track/detection
/// used at most once.
fn greedy_match(
    tracks: &[(TrackId, BoundingBox)],
    dets: &[BoundingBox],
    min_overlap: f32,
) -> Vec<(TrackId, usize)> {
    let mut pairs: Vec<(TrackId, usize, f32)> = Vec::new();
    for (track_id, bbox) in tracks {
        for (di, det) in dets.iter().enumerate() {
            let score = bbox.iou(det);
            if score > 0.0 && score >= min_overlap {
                pairs.push((*track_id, di, score));
            }
        }
    }
    pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_tracks = HashSet::new();
    let mut used_dets = HashSet::new();
    let mut matches = Vec::new();

    for (ti, di, _) in pairs {
        if !used_tracks.contains(&ti) && !used_dets.contains(&di) {
            used_tracks.insert(ti);
            used_dets.insert(di);
            matches.push((ti, di));
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: usize, expiry_frames: u32) -> StabilizerConfig {
        StabilizerConfig {
            window,
            expiry_frames,
            min_overlap: 0.3,
        }
    }

    fn matched(key: &str, similarity: f32) -> MatchResult {
        MatchResult {
            identity: Some(key.to_string()),
            candidate: Some(key.to_string()),
            similarity,
            is_match: true,
            ambiguous: false,
        }
    }

    fn rejected(similarity: f32) -> MatchResult {
        MatchResult {
            identity: None,
            candidate: Some("someone".to_string()),
            similarity,
            is_match: false,
            ambiguous: false,
        }
    }

    fn obs(x: f32, y: f32, result: MatchResult) -> FaceObservation {
        FaceObservation {
            bbox: BoundingBox::new(x, y, 50.0, 50.0),
            result,
        }
    }

    #[test]
    fn test_new_detections_get_unique_ids() {
        let mut stabilizer = TrackStabilizer::new(config(3, 5));
        let update = stabilizer.update(&[
            obs(0.0, 0.0, matched("alice", 0.9)),
            obs(200.0, 200.0, matched("bob", 0.8)),
        ]);
        assert_eq!(update.tracks.len(), 2);
        assert_eq!(update.created.len(), 2);
        assert_ne!(update.tracks[0].track_id, update.tracks[1].track_id);
    }

    #[test]
    fn test_consistent_id_across_frames() {
        let mut stabilizer = TrackStabilizer::new(config(3, 5));
        let first = stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.9))]);
        let id = first.tracks[0].track_id;

        let second = stabilizer.update(&[obs(14.0, 12.0, matched("alice", 0.9))]);
        assert_eq!(second.tracks.len(), 1);
        assert_eq!(second.tracks[0].track_id, id);
        assert!(second.created.is_empty());
    }

    #[test]
    fn test_provisional_until_window_filled() {
        let mut stabilizer = TrackStabilizer::new(config(3, 5));
        for _ in 0..2 {
            let update = stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.9))]);
            let track = &update.tracks[0];
            assert_eq!(track.state, TrackState::Provisional);
            assert_eq!(track.label, None);
            assert!(!track.is_match);
        }

        let update = stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.9))]);
        let track = &update.tracks[0];
        assert_eq!(track.state, TrackState::Stable);
        assert_eq!(track.label.as_deref(), Some("alice"));
        assert_eq!(track.identity.as_deref(), Some("alice"));
        assert!(track.is_match);
        assert!((track.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_single_frame_misclassification_does_not_flip_label() {
        let mut stabilizer = TrackStabilizer::new(config(5, 5));
        for _ in 0..5 {
            stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.8))]);
        }
        let update = stabilizer.update(&[obs(10.0, 10.0, matched("bob", 0.6))]);
        assert_eq!(update.tracks[0].label.as_deref(), Some("alice"));

        let update = stabilizer.update(&[obs(10.0, 10.0, rejected(0.1))]);
        assert_eq!(update.tracks[0].label.as_deref(), Some("alice"));
    }

    #[test]
    fn test_no_majority_shows_unknown() {
        let mut stabilizer = TrackStabilizer::new(config(4, 5));
        stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.8))]);
        stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.8))]);
        stabilizer.update(&[obs(10.0, 10.0, matched("bob", 0.8))]);
        let update = stabilizer.update(&[obs(10.0, 10.0, matched("bob", 0.8))]);

        let track = &update.tracks[0];
        assert_eq!(track.state, TrackState::Stable);
        assert_eq!(track.label.as_deref(), Some(UNKNOWN_LABEL));
        assert!(!track.is_match);
    }

    #[test]
    fn test_ambiguous_votes_count_as_unknown() {
        let mut stabilizer = TrackStabilizer::new(config(2, 5));
        let mut ambiguous = matched("alice", 0.9);
        ambiguous.ambiguous = true;
        stabilizer.update(&[obs(10.0, 10.0, ambiguous.clone())]);
        let update = stabilizer.update(&[obs(10.0, 10.0, ambiguous)]);
        assert_eq!(update.tracks[0].label.as_deref(), Some(UNKNOWN_LABEL));
    }

    #[test]
    fn test_unseen_track_is_reported_until_expiry() {
        let mut stabilizer = TrackStabilizer::new(config(1, 2));
        let first = stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.9))]);
        let id = first.tracks[0].track_id;

        let update = stabilizer.update(&[]);
        assert_eq!(update.tracks.len(), 1);
        assert_eq!(update.tracks[0].frames_since_seen, 1);
        assert_eq!(update.tracks[0].detection_index, None);
        assert_eq!(update.tracks[0].label.as_deref(), Some("alice"));

        let update = stabilizer.update(&[]);
        assert_eq!(update.tracks.len(), 1);

        let update = stabilizer.update(&[]);
        assert!(update.tracks.is_empty());
        assert_eq!(update.expired, vec![id]);
        assert!(stabilizer.is_empty());
    }

    #[test]
    fn test_track_survives_gap_within_expiry() {
        let mut stabilizer = TrackStabilizer::new(config(3, 3));
        let first = stabilizer.update(&[obs(10.0, 10.0, matched("alice", 0.9))]);
        let id = first.tracks[0].track_id;

        stabilizer.update(&[]);
        stabilizer.update(&[]);
        let update = stabilizer.update(&[obs(12.0, 10.0, matched("alice", 0.9))]);
        assert_eq!(update.tracks.len(), 1);
        assert_eq!(update.tracks[0].track_id, id);
        assert_eq!(update.tracks[0].frames_since_seen, 0);
        assert_eq!(stabilizer.tracks[&id].history.len(), 2);
    }

    #[test]
    fn test_low_overlap_spawns_new_track() {
        let mut stabilizer = TrackStabilizer::new(config(3, 5));
        stabilizer.update(&[obs(0.0, 0.0, matched("alice", 0.9))]);
        // Shifted by 40 of 50 px: IoU = 10*50 / (2500*2 - 500) ≈ 0.11.
        let update = stabilizer.update(&[obs(40.0, 0.0, matched("alice", 0.9))]);
        assert_eq!(update.created.len(), 1);
        assert_eq!(update.tracks.len(), 2);
    }

    #[test]
    fn test_detection_index_points_at_observation() {
        let mut stabilizer = TrackStabilizer::new(config(3, 5));
        stabilizer.update(&[obs(0.0, 0.0, matched("alice", 0.9))]);
        let update = stabilizer.update(&[
            obs(300.0, 300.0, matched("bob", 0.9)),
            obs(2.0, 2.0, matched("alice", 0.9)),
        ]);
        let alice = update.tracks.iter().find(|t| t.track_id == 1).unwrap();
        assert_eq!(alice.detection_index, Some(1));
        let bob = update.tracks.iter().find(|t| t.track_id == 2).unwrap();
        assert_eq!(bob.detection_index, Some(0));
    }

    #[test]
    fn test_greedy_match_prefers_highest_iou() {
        let tracks = vec![
            (1, BoundingBox::new(0.0, 0.0, 50.0, 50.0)),
            (2, BoundingBox::new(20.0, 0.0, 50.0, 50.0)),
        ];
        let dets = vec![BoundingBox::new(18.0, 0.0, 50.0, 50.0)];
        assert_eq!(greedy_match(&tracks, &dets, 0.3), vec![(2, 0)]);
    }
}
