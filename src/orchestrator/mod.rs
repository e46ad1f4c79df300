//! Blackboard orchestrator.
//!
//! Detectors run in waves. A wave is every not-yet-run detector whose trigger
//! conditions hold against the signals merged from earlier waves. Signals a
//! detector emits become visible to the next wave, never to its peers.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState};

use crate::aggregator::EvidenceAggregator;
use crate::config::{CircuitBreakerConfig, OrchestratorConfig};
use crate::detectors::{BlackboardState, DetectionContext, Detector, DetectorRegistry};
use crate::error::DetectorError;
use crate::evidence::{AggregatedEvidence, Contribution};
use crate::policy::{DetectionPolicy, Escalation};
use crate::signals::{all_satisfied, SYSTEM_COMPLETED_DETECTORS, SYSTEM_RISK, SYSTEM_WAVE};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How an orchestrator run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// A detector produced a verdict
    EarlyExit,
    /// The policy's confidence or block threshold was reached
    ThresholdReached,
    /// No further detector qualified
    Exhausted,
    /// The deadline elapsed; evidence is partial
    Timeout,
    /// The wave limit was reached
    MaxWaves,
}

/// Per-request blackboard. Survives policy hand-offs so detectors that
/// already ran are not repeated.
#[derive(Debug)]
pub struct PipelineSession {
    request: Arc<DetectionContext>,
    aggregator: EvidenceAggregator,
    ran: HashSet<String>,
    completed: usize,
    wave: usize,
    started: Instant,
    deadline: Instant,
    escalation: Escalation,
}

impl PipelineSession {
    pub fn new(request: DetectionContext, total_timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            request: Arc::new(request),
            aggregator: EvidenceAggregator::new(),
            ran: HashSet::new(),
            completed: 0,
            wave: 0,
            started,
            deadline: started + total_timeout,
            escalation: Escalation::default(),
        }
    }

    pub fn request(&self) -> &DetectionContext {
        &self.request
    }

    pub fn aggregator(&self) -> &EvidenceAggregator {
        &self.aggregator
    }

    pub fn evidence(&self) -> AggregatedEvidence {
        self.aggregator.aggregate()
    }

    /// Detectors started so far, including failed ones.
    pub fn has_run(&self, detector: &str) -> bool {
        self.ran.contains(detector)
    }

    pub fn completed_detectors(&self) -> usize {
        self.completed
    }

    pub fn waves(&self) -> usize {
        self.wave
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn escalation(&self) -> Escalation {
        self.escalation
    }

    /// Widen the detector set for the next run.
    pub fn escalate(&mut self, escalation: Escalation) {
        self.escalation.slow_path |= escalation.slow_path;
        self.escalation.ai |= escalation.ai;
    }
}

type WaveResult = (Arc<dyn Detector>, Result<Vec<Contribution>, DetectorError>, Duration);

/// Runs detectors in trigger-gated waves.
#[derive(Debug)]
pub struct BlackboardOrchestrator {
    registry: DetectorRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    config: OrchestratorConfig,
}

impl BlackboardOrchestrator {
    pub fn new(
        registry: DetectorRegistry,
        breaker_config: &CircuitBreakerConfig,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            breakers: Arc::new(CircuitBreakerRegistry::new(
                breaker_config.failure_threshold,
                breaker_config.reset_timeout(),
            )),
            config,
        }
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start a session bounded by the global deadline.
    pub fn session(&self, request: DetectionContext) -> PipelineSession {
        PipelineSession::new(request, self.config.total_timeout())
    }

    /// Run a request through one policy from a fresh session.
    pub async fn classify(
        &self,
        request: DetectionContext,
        policy: &DetectionPolicy,
    ) -> (AggregatedEvidence, PipelineOutcome) {
        let mut session = self.session(request);
        let outcome = self.run(&mut session, policy).await;
        (session.evidence(), outcome)
    }

    fn candidates(
        &self,
        policy: &DetectionPolicy,
        escalation: Escalation,
    ) -> Vec<Arc<dyn Detector>> {
        let selected = policy.detector_names(escalation);
        self.registry
            .by_priority()
            .into_iter()
            .filter(|d| d.is_enabled())
            .filter(|d| {
                selected
                    .as_ref()
                    .map_or(true, |names| names.iter().any(|n| n == d.name()))
            })
            .collect()
    }

    /// Run waves under `policy` until a verdict, a threshold, exhaustion, the
    /// deadline or the wave limit.
    pub async fn run(
        &self,
        session: &mut PipelineSession,
        policy: &DetectionPolicy,
    ) -> PipelineOutcome {
        let deadline = session.deadline.min(Instant::now() + policy.timeout());
        let mut candidates = self.candidates(policy, session.escalation);
        let mut waves = 0u32;

        loop {
            if session.aggregator.should_early_exit() {
                return PipelineOutcome::EarlyExit;
            }
            if Instant::now() >= deadline {
                debug!(
                    policy = %policy.name,
                    elapsed_ms = session.elapsed().as_millis() as u64,
                    "Pipeline deadline reached"
                );
                return PipelineOutcome::Timeout;
            }

            let signals = session.aggregator.signals();
            let ready: Vec<Arc<dyn Detector>> = candidates
                .iter()
                .filter(|d| !session.ran.contains(d.name()))
                .filter(|d| self.breakers.is_available(d.name()))
                .filter(|d| {
                    policy.bypass_trigger_conditions
                        || all_satisfied(&d.trigger_conditions(), &signals)
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                if self.should_escalate_to_ai(session, policy) {
                    session.escalation.ai = true;
                    candidates = self.candidates(policy, session.escalation);
                    info!(
                        policy = %policy.name,
                        probability = session.evidence().bot_probability,
                        "Escalating to AI path"
                    );
                    continue;
                }
                return PipelineOutcome::Exhausted;
            }

            // Marked before running so nothing re-triggers within this wave
            for detector in &ready {
                session.ran.insert(detector.name().to_string());
            }
            let ready: Vec<Arc<dyn Detector>> = ready
                .into_iter()
                .filter(|d| {
                    let admitted = self.breakers.try_acquire(d.name());
                    if !admitted {
                        debug!(detector = %d.name(), "Circuit open, skipping detector");
                    }
                    admitted
                })
                .collect();

            let state = Arc::new(BlackboardState {
                request: Arc::clone(&session.request),
                risk: session.evidence().bot_probability,
                signals,
                elapsed: session.elapsed(),
                wave: session.wave,
                policy: policy.name.clone(),
            });
            debug!(
                policy = %policy.name,
                wave = session.wave,
                detectors = ?ready.iter().map(|d| d.name()).collect::<Vec<_>>(),
                "Starting wave"
            );

            for (detector, result, elapsed) in self.execute_wave(ready, state, deadline).await {
                self.apply_result(session, policy, detector.as_ref(), result, elapsed);
            }

            if session.aggregator.should_early_exit() {
                return PipelineOutcome::EarlyExit;
            }

            let evidence = session.evidence();
            session.aggregator.publish_signal(SYSTEM_WAVE, session.wave as u64);
            session
                .aggregator
                .publish_signal(SYSTEM_COMPLETED_DETECTORS, session.completed as u64);
            session.aggregator.publish_signal(SYSTEM_RISK, evidence.bot_probability);

            if evidence.confidence >= policy.early_exit_threshold
                || evidence.bot_probability >= policy.immediate_block_threshold
            {
                debug!(
                    policy = %policy.name,
                    probability = evidence.bot_probability,
                    confidence = evidence.confidence,
                    "Policy threshold reached"
                );
                return PipelineOutcome::ThresholdReached;
            }

            session.wave += 1;
            waves += 1;
            if waves >= self.config.max_waves {
                return PipelineOutcome::MaxWaves;
            }

            let delay = self.config.inter_wave_delay();
            if !delay.is_zero() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(delay.min(remaining)).await;
            }
        }
    }

    fn should_escalate_to_ai(&self, session: &PipelineSession, policy: &DetectionPolicy) -> bool {
        if session.escalation.ai || !policy.has_ai_path() {
            return false;
        }
        let probability = session.evidence().bot_probability;
        probability >= policy.ai_escalation_threshold
            && probability < policy.immediate_block_threshold
    }

    async fn execute_wave(
        &self,
        detectors: Vec<Arc<dyn Detector>>,
        state: Arc<BlackboardState>,
        deadline: Instant,
    ) -> Vec<WaveResult> {
        let mut results = Vec::with_capacity(detectors.len());

        if !self.config.parallel || detectors.len() <= 1 {
            for detector in detectors {
                let handle = tokio::spawn(run_detector(
                    Arc::clone(&detector),
                    Arc::clone(&state),
                    deadline,
                ));
                results.push(join(detector, handle.await));
            }
            return results;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_detectors.max(1)));
        let handles: Vec<_> = detectors
            .into_iter()
            .map(|detector| {
                let semaphore = Arc::clone(&semaphore);
                let state = Arc::clone(&state);
                let task_detector = Arc::clone(&detector);
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    run_detector(task_detector, state, deadline).await
                });
                (detector, handle)
            })
            .collect();

        for (detector, handle) in handles {
            results.push(join(detector, handle.await));
        }
        results
    }

    fn apply_result(
        &self,
        session: &mut PipelineSession,
        policy: &DetectionPolicy,
        detector: &dyn Detector,
        result: Result<Vec<Contribution>, DetectorError>,
        elapsed: Duration,
    ) {
        let name = detector.name();
        match result {
            Ok(contributions) => {
                let multiplier = policy.weight_for(name);
                let count = contributions.len();
                for contribution in contributions {
                    let weight = contribution.weight * multiplier;
                    session.aggregator.add_contribution(
                        contribution.with_processing_time(elapsed).with_weight(weight),
                    );
                }
                session.completed += 1;
                self.breakers.record_success(name);
                debug!(
                    detector = %name,
                    wave = session.wave,
                    contributions = count,
                    elapsed_us = elapsed.as_micros() as u64,
                    "Detector completed"
                );
            }
            Err(e) => {
                session.aggregator.add_contribution(
                    Contribution::failure(name, e.to_string()).with_processing_time(elapsed),
                );
                session.aggregator.record_failure(name);
                let circuit = self.breakers.record_failure(name);
                if detector.is_optional() {
                    warn!(
                        detector = %name,
                        error = %e,
                        timed_out = e.is_timeout(),
                        circuit = ?circuit,
                        "Detector failed"
                    );
                } else {
                    error!(
                        detector = %name,
                        error = %e,
                        circuit = ?circuit,
                        "Required detector failed"
                    );
                }
            }
        }
    }
}

async fn run_detector(
    detector: Arc<dyn Detector>,
    state: Arc<BlackboardState>,
    deadline: Instant,
) -> (Result<Vec<Contribution>, DetectorError>, Duration) {
    let started = Instant::now();
    let budget = detector
        .execution_timeout()
        .min(deadline.saturating_duration_since(started));

    let result = match tokio::time::timeout(budget, detector.contribute(&state)).await {
        Ok(result) => result,
        Err(_) => Err(DetectorError::Timeout {
            detector: detector.name().to_string(),
            elapsed: started.elapsed(),
        }),
    };
    (result, started.elapsed())
}

fn join(
    detector: Arc<dyn Detector>,
    joined: Result<(Result<Vec<Contribution>, DetectorError>, Duration), tokio::task::JoinError>,
) -> WaveResult {
    match joined {
        Ok((result, elapsed)) => (detector, result, elapsed),
        Err(e) => {
            let err = DetectorError::Aborted {
                detector: detector.name().to_string(),
                message: e.to_string(),
            };
            (detector, Err(err), Duration::ZERO)
        }
    }
}
