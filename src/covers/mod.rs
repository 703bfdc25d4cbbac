/*!
Cover engine: position-tracked state machines over antagonistic relay pairs.

Purpose:
- A cover drives two physically antagonistic relays (up/down) with a hard
  interlock: energizing one direction always releases the other first, in
  the same control tick. At no instant may both relays be commanded on.
- `position` (0 closed .. 100 open) is integrated from wall-clock elapsed
  time on every tick; the PLC is not consulted for position. Blinds carry a
  secondary `tilt` that moves during the first `tilt_change_time` seconds of
  travel while `position` holds at its endpoint.
- Direction reversals are never immediate: the moving relay is released, a
  guard interval passes, then the opposite relay energizes.

State machine:
- `idle/stopped --open/close--> opening/closing` (through `tilting_*` while
  the tilt window runs, `calibrating` while the position is still unknown).
- Auto-stop on reaching an end-stop or a scheduled set-position deadline.
- `stop` freezes position/tilt at their integrated values.

Safety:
- If a relay the engine believes to be off is observed energized at the
  start of a tick, the engine stops immediately and logs the violation.
- Relay write failures are logged by the scanner; the moving state re-issues
  its relay intent on every tick, so a dropped write heals within a tick.
*/

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::{Config, CoverConfig};
use crate::error::ConfigError;
use crate::features::{Feature, FeatureKind, FeatureMap};
use crate::logging::prefix;

/// Guard interval between releasing one direction and energizing the other.
pub const DEFAULT_REVERSE_HOLD: Duration = Duration::from_millis(500);

/// How often the cover task integrates and publishes.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoverState {
    Idle,
    Opening,
    Closing,
    TiltingOpen,
    TiltingClose,
    Stopped,
    Calibrating,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoverCommand {
    Open,
    Close,
    Stop,
    SetPosition(u8),
    SetTilt(u8),
}

impl CoverCommand {
    /// Parse a command from the topic action and payload. Unknown payloads
    /// yield `None` and are ignored; out-of-range numbers clamp to 0..=100.
    pub fn parse(action: &str, payload: &str) -> Option<Self> {
        match action {
            "set" => match payload {
                "OPEN" => Some(CoverCommand::Open),
                "CLOSE" => Some(CoverCommand::Close),
                "STOP" => Some(CoverCommand::Stop),
                _ => None,
            },
            "set_position" => {
                let value: i64 = payload.trim().parse().ok()?;
                Some(CoverCommand::SetPosition(value.clamp(0, 100) as u8))
            }
            "set_tilt" => {
                let value: i64 = payload.trim().parse().ok()?;
                Some(CoverCommand::SetTilt(value.clamp(0, 100) as u8))
            }
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn sign(self) -> f32 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }
}

/// An in-flight move.
#[derive(Copy, Clone, Debug)]
struct Motion {
    direction: Direction,
    started: Instant,
    start_position: f32,
    start_tilt: f32,
    /// Scheduled stop for set-position moves and calibration.
    deadline: Option<Instant>,
    /// Snap targets applied when the deadline fires.
    target_position: Option<f32>,
    target_tilt: Option<f32>,
    calibrating: bool,
}

/// A reversal waiting out the guard interval.
#[derive(Copy, Clone, Debug)]
struct Pending {
    direction: Direction,
    not_before: Instant,
    target_position: Option<f32>,
    target_tilt: Option<f32>,
}

#[derive(Debug)]
pub struct Cover {
    pub object_id: String,
    pub friendly_name: String,
    pub suggested_area: Option<String>,
    pub device_class: String,

    run_time: Duration,
    tilt_time: Duration,
    reverse_hold: Duration,
    relay_up: Arc<Feature>,
    relay_down: Arc<Feature>,
    topic: String,

    state: CoverState,
    /// Unknown until the first full-range calibration move completes.
    position: Option<f32>,
    tilt: f32,
    motion: Option<Motion>,
    pending: Option<Pending>,
    /// The engine's relay intent, checked against observations each tick.
    intent_up: bool,
    intent_down: bool,

    last_state_published: Option<String>,
    last_position_published: Option<u8>,
    last_tilt_published: Option<u8>,
}

impl Cover {
    pub fn new(
        config: &CoverConfig,
        device_slug: &str,
        relay_up: Arc<Feature>,
        relay_down: Arc<Feature>,
    ) -> Self {
        Self {
            topic: format!("{device_slug}/cover/{}", config.object_id),
            object_id: config.object_id.clone(),
            friendly_name: config
                .friendly_name
                .clone()
                .unwrap_or_else(|| config.object_id.clone()),
            suggested_area: config.suggested_area.clone(),
            device_class: config.device_class.clone(),
            run_time: config.run_time(),
            tilt_time: config.tilt_time(),
            reverse_hold: DEFAULT_REVERSE_HOLD,
            relay_up,
            relay_down,
            state: CoverState::Idle,
            position: None,
            tilt: 0.0,
            motion: None,
            pending: None,
            intent_up: false,
            intent_down: false,
            last_state_published: None,
            last_position_published: None,
            last_tilt_published: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state_topic(&self) -> String {
        format!("{}/state", self.topic)
    }

    pub fn position_topic(&self) -> String {
        format!("{}/position", self.topic)
    }

    pub fn state(&self) -> CoverState {
        self.state
    }

    pub fn position(&self) -> Option<f32> {
        self.position
    }

    pub fn tilt_enabled(&self) -> bool {
        !self.tilt_time.is_zero()
    }

    /// Whether this cover handles commands for `object_id`.
    pub fn matches(&self, object_id: &str) -> bool {
        self.object_id == object_id
    }

    #[cfg(test)]
    pub fn assume_position(&mut self, position: f32, tilt: f32) {
        self.position = Some(position);
        self.tilt = tilt;
        self.state = CoverState::Stopped;
    }

    pub async fn command(&mut self, command: CoverCommand, now: Instant) {
        match command {
            CoverCommand::Open => self.request_move(Direction::Up, None, None, now).await,
            CoverCommand::Close => self.request_move(Direction::Down, None, None, now).await,
            CoverCommand::Stop => {
                self.pending = None;
                self.halt(now).await;
            }
            CoverCommand::SetPosition(target) => {
                let target = f32::from(target);
                match self.position {
                    None => {
                        // Not calibrated yet: run against the nearer end-stop
                        // first so the position becomes known.
                        let direction =
                            if target >= 50.0 { Direction::Up } else { Direction::Down };
                        self.request_move(direction, None, None, now).await;
                    }
                    Some(current) if (target - current).abs() < 0.5 => {}
                    Some(current) => {
                        let direction =
                            if target > current { Direction::Up } else { Direction::Down };
                        self.request_move(direction, Some(target), None, now).await;
                    }
                }
            }
            CoverCommand::SetTilt(target) => {
                if !self.tilt_enabled() || self.position.is_none() {
                    return;
                }
                let target = f32::from(target);
                if (target - self.tilt).abs() < 0.5 {
                    return;
                }
                let direction = if target > self.tilt { Direction::Up } else { Direction::Down };
                self.request_move(direction, None, Some(target), now).await;
            }
        }
    }

    async fn request_move(
        &mut self,
        direction: Direction,
        target_position: Option<f32>,
        target_tilt: Option<f32>,
        now: Instant,
    ) {
        match self.motion {
            Some(motion) if motion.direction == direction => {
                // Same direction: just reschedule the deadline.
                self.start_motion(direction, target_position, target_tilt, now).await;
            }
            Some(_) => {
                // Reversal: release, wait out the guard, then go the other way.
                self.halt(now).await;
                self.pending = Some(Pending {
                    direction,
                    not_before: now + self.reverse_hold,
                    target_position,
                    target_tilt,
                });
            }
            None => self.start_motion(direction, target_position, target_tilt, now).await,
        }
    }

    async fn start_motion(
        &mut self,
        direction: Direction,
        target_position: Option<f32>,
        target_tilt: Option<f32>,
        now: Instant,
    ) {
        self.assert_relays(direction).await;

        let calibrating = self.position.is_none();
        let start_position = self.position.unwrap_or(0.0);
        let start_tilt = self.tilt;

        let tilt_window = self.tilt_window(direction, start_tilt, target_tilt);
        let deadline = if calibrating {
            Some(now + self.run_time + self.tilt_time)
        } else if let Some(target) = target_position {
            let travel = (target - start_position).abs() / 100.0;
            Some(now + tilt_window + self.run_time.mul_f32(travel))
        } else {
            target_tilt.map(|_| now + tilt_window)
        };

        self.motion = Some(Motion {
            direction,
            started: now,
            start_position,
            start_tilt,
            deadline,
            target_position,
            target_tilt,
            calibrating,
        });
        self.state = if calibrating {
            CoverState::Calibrating
        } else if !tilt_window.is_zero() {
            match direction {
                Direction::Up => CoverState::TiltingOpen,
                Direction::Down => CoverState::TiltingClose,
            }
        } else {
            match direction {
                Direction::Up => CoverState::Opening,
                Direction::Down => CoverState::Closing,
            }
        };
    }

    /// Seconds of motion consumed by the tilt sub-position before the
    /// position itself starts moving.
    fn tilt_window(
        &self,
        direction: Direction,
        start_tilt: f32,
        target_tilt: Option<f32>,
    ) -> Duration {
        if !self.tilt_enabled() {
            return Duration::ZERO;
        }
        let end = target_tilt.unwrap_or(match direction {
            Direction::Up => 100.0,
            Direction::Down => 0.0,
        });
        self.tilt_time.mul_f32((end - start_tilt).abs() / 100.0)
    }

    /// Release both relays and freeze position/tilt at their integrated
    /// values. Keeps any pending reversal.
    async fn halt(&mut self, now: Instant) {
        if let Some(motion) = self.motion.take() {
            let (position, tilt) = self.integrate(&motion, now);
            self.position = position;
            self.tilt = tilt;
        }
        self.release_both().await;
        self.state = if self.position.is_some() { CoverState::Stopped } else { CoverState::Idle };
    }

    async fn release_both(&mut self) {
        self.intent_up = false;
        self.intent_down = false;
        if let Err(err) = self.relay_up.set_state(false).await {
            warn!("{} [{}] Relay release failed: {}", prefix::COVER, self.object_id, err);
        }
        if let Err(err) = self.relay_down.set_state(false).await {
            warn!("{} [{}] Relay release failed: {}", prefix::COVER, self.object_id, err);
        }
    }

    /// Drive the relay pair for a direction: the opposing relay is released
    /// before the moving one is energized, in this same call.
    async fn assert_relays(&mut self, direction: Direction) {
        let (own, other) = match direction {
            Direction::Up => (&self.relay_up, &self.relay_down),
            Direction::Down => (&self.relay_down, &self.relay_up),
        };
        if let Err(err) = other.set_state(false).await {
            warn!("{} [{}] Relay release failed: {}", prefix::COVER, self.object_id, err);
        }
        if let Err(err) = own.set_state(true).await {
            warn!("{} [{}] Relay write failed: {}", prefix::COVER, self.object_id, err);
        }
        match direction {
            Direction::Up => {
                self.intent_up = true;
                self.intent_down = false;
            }
            Direction::Down => {
                self.intent_down = true;
                self.intent_up = false;
            }
        }
    }

    fn integrate(&self, motion: &Motion, now: Instant) -> (Option<f32>, f32) {
        let elapsed = now.saturating_duration_since(motion.started).as_secs_f32();
        if motion.calibrating {
            return (None, self.tilt);
        }

        let sign = motion.direction.sign();
        let tilt_window =
            self.tilt_window(motion.direction, motion.start_tilt, motion.target_tilt);
        let tilt = if self.tilt_enabled() {
            let tilt_elapsed = elapsed.min(tilt_window.as_secs_f32());
            let rate = 100.0 / self.tilt_time.as_secs_f32();
            (motion.start_tilt + sign * tilt_elapsed * rate).clamp(0.0, 100.0)
        } else {
            self.tilt
        };

        let travel_elapsed = (elapsed - tilt_window.as_secs_f32()).max(0.0);
        let rate = 100.0 / self.run_time.as_secs_f32();
        let position = (motion.start_position + sign * travel_elapsed * rate).clamp(0.0, 100.0);

        (Some(position), tilt)
    }

    /// Advance the state machine: safety check, pending reversal, position
    /// integration, deadline/end-stop handling, relay intent re-issue.
    pub async fn tick(&mut self, now: Instant) {
        if self.safety_violation() {
            error!(
                "{} [{}] Both relays observed energized, stopping!",
                prefix::COVER, self.object_id
            );
            self.pending = None;
            self.halt(now).await;
            return;
        }

        if let Some(pending) = self.pending
            && now >= pending.not_before
        {
            self.pending = None;
            self.start_motion(pending.direction, pending.target_position, pending.target_tilt, now)
                .await;
        }

        let Some(motion) = self.motion else {
            return;
        };

        let (position, tilt) = self.integrate(&motion, now);
        self.tilt = tilt;

        let deadline_reached = motion.deadline.is_some_and(|deadline| now >= deadline);
        if motion.calibrating {
            if deadline_reached {
                // Ran against the end-stop; the position is now known.
                let (position, tilt) = match motion.direction {
                    Direction::Up => (100.0, 100.0),
                    Direction::Down => (0.0, 0.0),
                };
                self.position = Some(position);
                if self.tilt_enabled() {
                    self.tilt = tilt;
                }
                self.motion = None;
                self.release_both().await;
                self.state = CoverState::Stopped;
            }
            return;
        }

        self.position = position;
        let position = position.unwrap_or(0.0);

        let end_stop = match motion.direction {
            Direction::Up => position >= 100.0,
            Direction::Down => position <= 0.0,
        };

        if deadline_reached || end_stop {
            if deadline_reached {
                if let Some(target) = motion.target_position {
                    self.position = Some(target);
                }
                if let Some(target) = motion.target_tilt {
                    self.tilt = target;
                }
            }
            self.motion = None;
            self.release_both().await;
            self.state = CoverState::Stopped;
            return;
        }

        // Past the tilt window the state leaves tilting_*.
        let tilt_window =
            self.tilt_window(motion.direction, motion.start_tilt, motion.target_tilt);
        let in_tilt_window = now.saturating_duration_since(motion.started) < tilt_window;
        self.state = match (motion.direction, in_tilt_window) {
            (Direction::Up, true) => CoverState::TiltingOpen,
            (Direction::Up, false) => CoverState::Opening,
            (Direction::Down, true) => CoverState::TiltingClose,
            (Direction::Down, false) => CoverState::Closing,
        };

        // Re-issue relay intent; a write the bus dropped heals here.
        self.assert_relays(motion.direction).await;
    }

    /// A relay the engine believes off is observed energized.
    fn safety_violation(&self) -> bool {
        let up_observed = self.relay_up.raw_state() == Some(true);
        let down_observed = self.relay_down.raw_state() == Some(true);
        (up_observed && !self.intent_up) || (down_observed && !self.intent_down)
    }

    /// State and position payloads that changed since the last publish.
    pub fn pending_publishes(&mut self) -> Vec<(String, String)> {
        let mut out = Vec::new();

        let state = self.state_payload();
        if self.last_state_published.as_deref() != Some(state) {
            self.last_state_published = Some(state.to_string());
            out.push((self.state_topic(), state.to_string()));
        }

        if let Some(position) = self.position {
            let position = position.round() as u8;
            if self.last_position_published != Some(position) {
                self.last_position_published = Some(position);
                out.push((self.position_topic(), position.to_string()));
            }
        }

        if self.tilt_enabled() && self.position.is_some() {
            let tilt = self.tilt.round() as u8;
            if self.last_tilt_published != Some(tilt) {
                self.last_tilt_published = Some(tilt);
                out.push((format!("{}/tilt", self.topic), tilt.to_string()));
            }
        }

        out
    }

    fn state_payload(&self) -> &'static str {
        match self.state {
            CoverState::Opening | CoverState::TiltingOpen => "opening",
            CoverState::Closing | CoverState::TiltingClose => "closing",
            CoverState::Calibrating => match self.motion.map(|m| m.direction) {
                Some(Direction::Down) => "closing",
                _ => "opening",
            },
            CoverState::Idle | CoverState::Stopped => match self.position {
                Some(p) if p <= 0.0 => "closed",
                Some(p) if p >= 100.0 => "open",
                _ => "stopped",
            },
        }
    }

    /// Cancellation path: release the relays before the task unwinds.
    pub async fn release(&mut self, now: Instant) {
        self.pending = None;
        self.halt(now).await;
    }
}

/// All covers, built from the configuration against the feature map.
#[derive(Default, Debug)]
pub struct CoverMap {
    covers: Vec<Cover>,
}

impl CoverMap {
    /// Resolve each cover's relay circuits and claim its object id. The
    /// relays must exist in the feature map and be outputs; their object ids
    /// share the global uniqueness rule with features.
    pub fn build(config: &Config, features: &mut FeatureMap) -> Result<Self, ConfigError> {
        let slug = config.device_slug();
        let mut covers = Vec::new();

        for cover_config in &config.covers {
            features.claim_object_id(&cover_config.object_id)?;

            let relay_up = Self::resolve_relay(features, cover_config, &cover_config.cover_up)?;
            let relay_down = Self::resolve_relay(features, cover_config, &cover_config.cover_down)?;

            covers.push(Cover::new(cover_config, &slug, relay_up, relay_down));
        }

        Ok(Self { covers })
    }

    fn resolve_relay(
        features: &FeatureMap,
        cover: &CoverConfig,
        circuit: &str,
    ) -> Result<Arc<Feature>, ConfigError> {
        let feature = features.get(circuit).ok_or_else(|| ConfigError::UnknownCoverCircuit {
            object_id: cover.object_id.clone(),
            circuit: circuit.to_string(),
        })?;
        if !matches!(feature.kind, FeatureKind::Relay | FeatureKind::DigitalOutput) {
            return Err(ConfigError::UnknownCoverCircuit {
                object_id: cover.object_id.clone(),
                circuit: circuit.to_string(),
            });
        }
        Ok(feature.clone())
    }

    pub fn len(&self) -> usize {
        self.covers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.covers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cover> {
        self.covers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Cover> {
        self.covers.iter_mut()
    }

    /// Route a command to the cover owning `object_id`.
    pub async fn command(&mut self, object_id: &str, command: CoverCommand, now: Instant) {
        for cover in &mut self.covers {
            if cover.matches(object_id) {
                cover.command(command, now).await;
            }
        }
    }

    /// Tick every cover and collect due state/position publishes.
    pub async fn tick_all(&mut self, now: Instant) -> Vec<(String, String)> {
        let mut publishes = Vec::new();
        for cover in &mut self.covers {
            cover.tick(now).await;
            publishes.extend(cover.pending_publishes());
        }
        publishes
    }

    /// Release every relay; called when the control plane unwinds.
    pub async fn release_all(&mut self, now: Instant) {
        for cover in &mut self.covers {
            cover.release(now).await;
        }
    }
}
