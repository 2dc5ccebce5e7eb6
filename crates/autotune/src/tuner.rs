//! Core autotuning logic: randomized hill-climbing over the hyper-parameter
//! graph with restarts.

use crate::solution::{Solution, SolutionStatistics};
use fastrand::Rng;
use gemmtune_backend_gpu::{Device, Engine};
use gemmtune_kernels::{Bundle, DeviceInfo, Geometry, HyperParams, Recoverable, Result, TuneError};
use gemmtune_optimizer::{Constraints, FindParams, Graph, Halt, Oracle, SummaryStat};
use std::collections::HashSet;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Smallest time slice handed to a descent, seconds.
pub const MIN_ALLOTTED_S: f64 = 0.1;

/// Progress of a whole search.
#[derive(Debug)]
pub struct FindTracker {
    start: Instant,
    descents: usize,
    kernels: usize,
}

impl FindTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            descents: 0,
            kernels: 0,
        }
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn descents(&self) -> usize {
        self.descents
    }

    /// Points benchmarked to completion.
    pub fn kernels(&self) -> usize {
        self.kernels
    }

    fn incr_descents(&mut self) {
        self.descents += 1;
    }

    fn incr_kernels(&mut self) {
        self.kernels += 1;
    }
}

impl fmt::Display for FindTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ELAPSED[s]: {:>8.2}  #RESTARTS: {:>4}  #GEMMS: {:>6}]",
            self.elapsed(),
            self.descents,
            self.kernels
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No member of the front improved on the path's best.
    LocalMinimum,
    TimeExceeded,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::LocalMinimum => f.write_str("no neighbor improves, at a local minimum"),
            Termination::TimeExceeded => f.write_str("allotted time exceeded"),
        }
    }
}

/// One hill-climb from a random start.
#[derive(Debug, Clone)]
pub struct Descent {
    /// Last accepted solution on the path.
    pub best: Solution,
    /// Every accepted solution, in acceptance order.
    pub path: Vec<Solution>,
    pub termination: Termination,
    /// Points taken from a front, including ones skipped as not viable.
    pub candidates: usize,
    pub elapsed_s: f64,
}

#[derive(Debug, Clone)]
pub struct FindReport {
    /// Highest throughput across all descents.
    pub best: Solution,
    pub descents: Vec<Descent>,
    /// Final [`FindTracker`] line.
    pub tracker: String,
}

enum DescentState {
    EvaluatingFront { front: Vec<HyperParams>, next: usize },
    ImprovementFound(HyperParams),
    TransitioningFront(HyperParams),
    Finished(Termination),
}

struct Measurement {
    bundle: Bundle,
    times_ms: Vec<f64>,
}

/// Drives an [`Engine`] through the search space, consulting an [`Oracle`]
/// for which points are worth compiling.
pub struct Tuner<D: Device, O: Oracle> {
    engine: Engine<D>,
    oracle: O,
}

impl<D: Device, O: Oracle> Tuner<D, O> {
    pub fn new(engine: Engine<D>, oracle: O) -> Self {
        Self { engine, oracle }
    }

    pub fn engine(&self) -> &Engine<D> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<D> {
        &mut self.engine
    }

    /// Best solution across descents restarted until the outer halt fires.
    pub fn find(&mut self, constraints: &Constraints, params: &FindParams, rng: &mut Rng) -> Result<Solution> {
        Ok(self.find_with_report(constraints, params, rng)?.best)
    }

    /// [`Self::find`], keeping every descent.
    pub fn find_with_report(
        &mut self,
        constraints: &Constraints,
        params: &FindParams,
        rng: &mut Rng,
    ) -> Result<FindReport> {
        self.engine.address_check_valid_and_reliable()?;
        params.validate()?;

        let mut tracker = FindTracker::start();
        let mut descents: Vec<Descent> = Vec::new();
        while !params.hl_outer.halt(tracker.descents(), tracker.elapsed()) {
            info!(
                status = %params.hl_outer.status(tracker.descents(), tracker.elapsed()),
                "entering new descent"
            );
            let allotted_s = (params.hl_outer.max_time - tracker.elapsed()).max(MIN_ALLOTTED_S);
            let descent = self.single_descent_find(allotted_s, constraints, params, &mut tracker, rng)?;
            tracker.incr_descents();
            descents.push(descent);
        }

        let mut best: Option<&Descent> = None;
        for descent in &descents {
            if best.map_or(true, |b| descent.best.statistics.gflops > b.best.statistics.gflops) {
                best = Some(descent);
            }
        }
        let best = best
            .ok_or_else(|| TuneError::logic("search finished without running a descent"))?
            .best
            .clone();

        let mut gflops: Vec<f64> = descents.iter().map(|d| d.best.statistics.gflops).collect();
        gflops.sort_by(|a, b| a.total_cmp(b));
        info!(%tracker, "search complete");
        info!(?gflops, best = %best.hyperstring, "descent gflops, ascending");

        Ok(FindReport {
            best,
            descents,
            tracker: tracker.to_string(),
        })
    }

    /// Hill-climbs from one random valid start until no neighbor of the
    /// path's best improves or `allotted_s` runs out.
    pub fn single_descent_find(
        &mut self,
        allotted_s: f64,
        constraints: &Constraints,
        params: &FindParams,
        tracker: &mut FindTracker,
        rng: &mut Rng,
    ) -> Result<Descent> {
        let timer = Instant::now();
        let geometry = self.engine.geometry().clone();
        let devinfo = self.engine.device().info().clone();
        let graph = Graph::new(&geometry, &devinfo, constraints)?;
        let start = graph.get_random_valid_start(&self.oracle, rng)?;
        debug!(start = %start, allotted_s, "descent start");

        let mut history: HashSet<HyperParams> = HashSet::new();
        let mut path: Vec<Solution> = Vec::new();
        let mut candidates = 0usize;
        let mut state = DescentState::EvaluatingFront {
            front: vec![start],
            next: 0,
        };

        let termination = loop {
            state = match state {
                DescentState::EvaluatingFront { front, next } => {
                    if timer.elapsed().as_secs_f64() >= allotted_s {
                        DescentState::Finished(Termination::TimeExceeded)
                    } else if next >= front.len() {
                        DescentState::Finished(Termination::LocalMinimum)
                    } else {
                        let hp = front[next].clone();
                        history.insert(hp.clone());
                        candidates += 1;
                        info!(
                            candidate = candidates,
                            elapsed_s = format_args!("{:.2}", timer.elapsed().as_secs_f64()),
                            hp = %hp,
                            "benchmarking"
                        );
                        match self.measure(&hp, &geometry, &devinfo, &params.hl_core) {
                            Ok(measurement) => {
                                tracker.incr_kernels();
                                let statistics = self.statistics(&measurement, params, &geometry, &timer)?;
                                let best = path.last().map(|s| s.statistics.time_ms);
                                if params.acceptance.accepts(best, statistics.time_ms) {
                                    info!(
                                        time_ms = format_args!("{:.4}", statistics.time_ms),
                                        gflops = format_args!("{:.2}", statistics.gflops),
                                        "NEW BEST"
                                    );
                                    path.push(Solution {
                                        hyperstring: hp.to_string(),
                                        hp: hp.clone(),
                                        geometry: geometry.clone(),
                                        kernels: measurement.bundle.descriptors,
                                        statistics,
                                        device_name: devinfo.device_name.clone(),
                                        constraints: constraints.to_string(),
                                    });
                                    DescentState::ImprovementFound(hp)
                                } else {
                                    DescentState::EvaluatingFront { front, next: next + 1 }
                                }
                            }
                            Err(e) if !e.is_fatal() => {
                                warn!(error = %e, hp = %hp, "skipping candidate");
                                DescentState::EvaluatingFront { front, next: next + 1 }
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                DescentState::ImprovementFound(hp) => {
                    if timer.elapsed().as_secs_f64() < allotted_s {
                        DescentState::TransitioningFront(hp)
                    } else {
                        DescentState::Finished(Termination::TimeExceeded)
                    }
                }
                DescentState::TransitioningFront(hp) => {
                    let front = self.next_front(&graph, &hp, &history, &geometry, rng)?;
                    debug!(size = front.len(), "new front");
                    DescentState::EvaluatingFront { front, next: 0 }
                }
                DescentState::Finished(termination) => break termination,
            };
        };

        let elapsed_s = timer.elapsed().as_secs_f64();
        let best = path.last().cloned().ok_or_else(|| {
            TuneError::logic(format!(
                "descent accepted no solutions after {candidates} candidates ({termination})"
            ))
        })?;
        info!(
            reason = %termination,
            steps = path.len(),
            candidates,
            elapsed_s = format_args!("{elapsed_s:.2}"),
            "descent finished"
        );
        for (step, soln) in path.iter().enumerate() {
            debug!(
                step,
                time_ms = format_args!("{:.4}", soln.statistics.time_ms),
                gflops = format_args!("{:.2}", soln.statistics.gflops),
                found_s = format_args!("{:.2}", soln.statistics.discovery_s),
                hp = %soln.hyperstring,
                "path"
            );
        }

        Ok(Descent {
            best,
            path,
            termination,
            candidates,
            elapsed_s,
        })
    }

    /// Benchmarks one point, returning each run's time in milliseconds.
    ///
    /// With no front to fall back on, a point the device cannot run is a
    /// configuration error here.
    pub fn benchgemm(&mut self, hp: &HyperParams, halt: &Halt) -> Result<Vec<f64>> {
        self.engine.address_check_valid()?;
        halt.validate().map_err(TuneError::config)?;
        let geometry = self.engine.geometry().clone();
        let devinfo = self.engine.device().info().clone();
        let measurement = self.measure(hp, &geometry, &devinfo, halt).map_err(|e| match e {
            TuneError::Recoverable(Recoverable::Capability(msg)) => {
                TuneError::config(format!("{hp} cannot run on {}: {msg}", devinfo.device_name))
            }
            other => other,
        })?;
        Ok(measurement.times_ms)
    }

    fn measure(
        &mut self,
        hp: &HyperParams,
        geometry: &Geometry,
        devinfo: &DeviceInfo,
        halt: &Halt,
    ) -> Result<Measurement> {
        let derivability = self.oracle.derivability(hp, geometry);
        if !derivability.passed {
            return Err(TuneError::logic(format!(
                "{hp} reached the benchmark but is not derivable: {}",
                derivability.msg
            )));
        }
        let bundle = Bundle::new(hp, geometry)?;
        let capability = self.oracle.capability(hp, geometry, devinfo);
        if !capability.passed {
            return Err(TuneError::capability(capability.msg));
        }
        for (k, descriptor) in bundle.descriptors.iter().enumerate() {
            debug!(
                kernel = k,
                role = descriptor.role.name(),
                waits = ?bundle.wait_indices[k],
                "wait network"
            );
        }

        self.engine.setup(&bundle)?;
        debug!(heading = %self.engine.run_times_heading());
        let mut times_ms = Vec::new();
        self.engine.run(halt, |extime, line| {
            debug!(%line);
            times_ms.push(extime);
        })?;
        Ok(Measurement { bundle, times_ms })
    }

    fn statistics(
        &self,
        measurement: &Measurement,
        params: &FindParams,
        geometry: &Geometry,
        timer: &Instant,
    ) -> Result<SolutionStatistics> {
        let times = &measurement.times_ms;
        let no_runs = || TuneError::logic("benchmark produced no timed runs");
        let time_ms = params.sumstat.select(times).ok_or_else(no_runs)?;
        let fastest_ms = SummaryStat::Min.select(times).ok_or_else(no_runs)?;
        let median_ms = SummaryStat::Median.select(times).ok_or_else(no_runs)?;
        let found_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Ok(SolutionStatistics {
            time_ms,
            fastest_ms,
            median_ms,
            gflops: geometry.gflops(time_ms),
            discovery_s: timer.elapsed().as_secs_f64(),
            found_at_unix,
            find_params: params.clone(),
        })
    }

    fn next_front(
        &self,
        graph: &Graph,
        hp: &HyperParams,
        history: &HashSet<HyperParams>,
        geometry: &Geometry,
        rng: &mut Rng,
    ) -> Result<Vec<HyperParams>> {
        let neighbors = graph.get_neighbors(hp, rng)?;
        let mut seen: HashSet<&HyperParams> = HashSet::with_capacity(neighbors.len());
        for neighbor in &neighbors {
            if !seen.insert(neighbor) {
                return Err(TuneError::logic(format!("duplicate neighbor {neighbor}")));
            }
            if !graph.contains(neighbor) {
                return Err(TuneError::logic(format!(
                    "neighbor {neighbor} of {hp} violates the constraints"
                )));
            }
        }

        let mut front = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            if history.contains(&neighbor) {
                continue;
            }
            if !self.oracle.derivability(&neighbor, geometry).passed {
                continue;
            }
            front.push(neighbor);
        }
        Ok(front)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemmtune_backend_gpu::{DeviceBuffers, SimDevice};
    use gemmtune_kernels::{FloatType, KernelRole, Mem, Offsets};
    use gemmtune_optimizer::{Acceptance, DefaultOracle, Verdict};
    use std::cell::Cell;

    const MAIN_ONLY: &str = "A_WOS0__B_WOS0__C_ICE1";

    fn engine(size: usize) -> Engine<SimDevice> {
        let gg = Geometry::packed(size, size, size, FloatType::F32).unwrap();
        let mut device = SimDevice::new(DeviceInfo::warp32("sim"), 3);
        let buffers = DeviceBuffers {
            a: device.allocate(gg.mem_size_bytes(Mem::A)),
            b: device.allocate(gg.mem_size_bytes(Mem::B)),
            c: device.allocate(gg.mem_size_bytes(Mem::C)),
            workspace: None,
        };
        Engine::new(device, gg, Offsets::zero(), buffers, false).unwrap()
    }

    fn point() -> HyperParams {
        HyperParams::new(
            vec![4, 1, 0, 0, 1, 0],
            vec![4, 1, 0, 0, 1, 0],
            vec![16, 2, 0, 1, 16, 0, 64, 10],
        )
        .unwrap()
    }

    /// Passes derivability through, rejects every capability check after
    /// the first `capable` ones.
    struct CountingOracle {
        capable: usize,
        calls: Cell<usize>,
    }

    impl Oracle for CountingOracle {
        fn derivability(&self, hp: &HyperParams, geometry: &Geometry) -> Verdict {
            DefaultOracle.derivability(hp, geometry)
        }

        fn capability(&self, _: &HyperParams, _: &Geometry, _: &DeviceInfo) -> Verdict {
            let n = self.calls.get();
            self.calls.set(n + 1);
            if n < self.capable {
                Verdict::pass()
            } else {
                Verdict::fail("over budget")
            }
        }
    }

    #[test]
    fn test_tracker_string() {
        let tracker = FindTracker::start();
        let s = tracker.to_string();
        assert!(s.starts_with("[ELAPSED[s]:"));
        assert!(s.contains("#RESTARTS:    0"));
        assert!(s.ends_with("#GEMMS:      0]"));
    }

    #[test]
    fn test_benchgemm_runs_requested_times() {
        let mut tuner = Tuner::new(engine(256), DefaultOracle);
        let times = tuner.benchgemm(&point(), &Halt::runs(3)).unwrap();
        assert_eq!(times.len(), 3);
        assert_eq!(tuner.engine().active_roles(), &[KernelRole::Main]);
    }

    #[test]
    fn test_benchgemm_rejects_bad_halt() {
        let mut tuner = Tuner::new(engine(256), DefaultOracle);
        let err = tuner.benchgemm(&point(), &Halt::new(3, 1, 0.0, 1.0)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_benchgemm_capability_failure_is_configuration_error() {
        let oracle = CountingOracle {
            capable: 0,
            calls: Cell::new(0),
        };
        let mut tuner = Tuner::new(engine(256), oracle);
        let err = tuner.benchgemm(&point(), &Halt::runs(3)).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("over budget"));
        assert_eq!(tuner.engine().device().enqueues(), 0);
    }

    #[test]
    fn test_descent_path_improves_monotonically() {
        let mut tuner = Tuner::new(engine(256), DefaultOracle);
        let constraints: Constraints = MAIN_ONLY.parse().unwrap();
        let params = FindParams::at_least_n_restarts(1).with_acceptance(Acceptance::Strict);
        let mut tracker = FindTracker::start();
        let mut rng = Rng::with_seed(11);
        let descent = tuner
            .single_descent_find(f64::MAX, &constraints, &params, &mut tracker, &mut rng)
            .unwrap();
        assert_eq!(descent.termination, Termination::LocalMinimum);
        assert!(!descent.path.is_empty());
        for pair in descent.path.windows(2) {
            assert!(pair[1].statistics.time_ms < pair[0].statistics.time_ms);
        }
        assert_eq!(descent.best, *descent.path.last().unwrap());
        assert!(tracker.kernels() >= descent.path.len());
        let distinct: HashSet<_> = descent.path.iter().map(|s| s.hp.clone()).collect();
        assert_eq!(distinct.len(), descent.path.len());
    }

    #[test]
    fn test_zero_allotted_time_stops_immediately() {
        let mut tuner = Tuner::new(engine(256), DefaultOracle);
        let params = FindParams::at_least_n_restarts(1);
        let mut tracker = FindTracker::start();
        let mut rng = Rng::with_seed(2);
        let err = tuner
            .single_descent_find(0.0, &Constraints::none(), &params, &mut tracker, &mut rng)
            .unwrap_err();
        assert!(err.is_logic());
        assert_eq!(tracker.kernels(), 0);
    }

    #[test]
    fn test_capability_rejections_are_skipped() {
        // The first check admits the start; the start then benchmarks and
        // every neighbor after it is rejected.
        let oracle = CountingOracle {
            capable: 2,
            calls: Cell::new(0),
        };
        let mut tuner = Tuner::new(engine(256), oracle);
        let constraints: Constraints = MAIN_ONLY.parse().unwrap();
        let mut tracker = FindTracker::start();
        let mut rng = Rng::with_seed(4);
        let descent = tuner
            .single_descent_find(
                f64::MAX,
                &constraints,
                &FindParams::at_least_n_restarts(1),
                &mut tracker,
                &mut rng,
            )
            .unwrap();
        assert_eq!(descent.path.len(), 1);
        assert_eq!(descent.termination, Termination::LocalMinimum);
        assert_eq!(tracker.kernels(), 1);
        assert!(descent.candidates > 1);
    }
}
