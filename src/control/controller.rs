//! The global fit controller: worker pool and region scheduling.
//!
//! Lifecycle: `new` -> `init` -> `run_workers` -> {completed | terminated}.
//! `init` validates the composition and sizes the worker pool;
//! `run_workers` spawns the workers (or runs synchronously when the pool
//! resolves to one fitter) and either blocks until completion or returns
//! immediately in async mode, leaving callers to poll [`FitStatus`].
//!
//! Scheduling follows the coupling mode:
//!
//! - **Pixelwise**: every thread works on the *same* region in lockstep.
//!   Thread 0 is the leader: it waits for all followers to finish the
//!   previous region, stages the next region's data, then releases the
//!   followers through the shared condvar. Region order is global.
//! - **Imagewise**: a shared monotone counter hands out region indices on
//!   demand; per-thread current-image markers track the lowest image still
//!   in use so upstream buffers could be released behind the fits.
//! - **Global**: regions are statically partitioned by
//!   `region_index % n_fitters`.
//!
//! Cancellation is a single cooperative flag polled in every work loop
//! (and once per outer optimizer iteration inside the fits). The last
//! worker out performs the shared state transition exactly once.

use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, info};

use crate::data::{FitData, RegionData};
use crate::domain::{CouplingMode, FitSettings, RunState};
use crate::control::results::FitResults;
use crate::control::status::FitStatus;
use crate::error::FitError;
use crate::fit::RegionFitter;
use crate::model::DecayModel;

pub struct FitController {
    settings: FitSettings,
    model: DecayModel,
    data: Arc<dyn FitData>,
    status: Arc<FitStatus>,
    results: Option<Arc<FitResults>>,
    sched: Option<Arc<SchedState>>,
    workers: Vec<JoinHandle<()>>,
    n_fitters: usize,
    conf_factor: f64,
    /// Slot offset per region index, for pixelwise per-pixel slots.
    slot_offsets: Arc<Vec<usize>>,
    initialised: bool,
}

/// Scheduler state shared by the worker pool: one mutex/condvar pair plus
/// the staging buffer the pixelwise leader fills for its followers.
struct SchedState {
    inner: Mutex<SchedInner>,
    cv: Condvar,
    region_buf: RwLock<RegionData>,
}

struct SchedInner {
    /// Ordering index of the region currently staged (pixelwise).
    cur_region: i64,
    /// Next unclaimed region index (imagewise).
    next_region: usize,
    threads_active: usize,
    threads_started: usize,
    /// Image each thread is working in, -1 when done (imagewise).
    cur_im: Vec<i64>,
    /// Highest image index no thread needs anymore.
    releasable_below: i64,
}

impl SchedState {
    fn new(n_fitters: usize) -> Self {
        Self {
            inner: Mutex::new(SchedInner {
                cur_region: -1,
                next_region: 0,
                threads_active: 0,
                threads_started: 0,
                cur_im: vec![0; n_fitters],
                releasable_below: 0,
            }),
            cv: Condvar::new(),
            region_buf: RwLock::new(RegionData::default()),
        }
    }
}

/// Everything a worker thread owns or shares.
struct WorkerCtx {
    data: Arc<dyn FitData>,
    results: Arc<FitResults>,
    status: Arc<FitStatus>,
    sched: Arc<SchedState>,
    model: DecayModel,
    settings: FitSettings,
    conf_factor: f64,
    n_fitters: usize,
    slot_offsets: Arc<Vec<usize>>,
}

impl Clone for WorkerCtx {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            results: Arc::clone(&self.results),
            status: Arc::clone(&self.status),
            sched: Arc::clone(&self.sched),
            model: self.model.clone(),
            settings: self.settings.clone(),
            conf_factor: self.conf_factor,
            n_fitters: self.n_fitters,
            slot_offsets: Arc::clone(&self.slot_offsets),
        }
    }
}

impl FitController {
    pub fn new(
        model: DecayModel,
        data: Arc<dyn FitData>,
        settings: FitSettings,
    ) -> Result<Self, FitError> {
        settings.validate()?;
        Ok(Self {
            settings,
            model,
            data,
            status: Arc::new(FitStatus::new()),
            results: None,
            sched: None,
            workers: Vec::new(),
            n_fitters: 1,
            conf_factor: 0.0,
            slot_offsets: Arc::new(Vec::new()),
            initialised: false,
        })
    }

    pub fn status(&self) -> &Arc<FitStatus> {
        &self.status
    }

    pub fn results(&self) -> Option<&Arc<FitResults>> {
        self.results.as_ref()
    }

    pub fn busy(&self) -> bool {
        self.initialised && self.status.is_running()
    }

    pub fn state(&self) -> RunState {
        self.status.state()
    }

    /// Request cooperative termination of a running fit.
    pub fn stop_fit(&self) {
        self.status.terminate();
        if let Some(sched) = &self.sched {
            // Wake workers parked at the pixelwise barrier.
            let _guard = sched.inner.lock().expect("scheduler lock");
            sched.cv.notify_all();
        }
    }

    /// Validate the composition and size the worker pool.
    pub fn init(&mut self) -> Result<(), FitError> {
        if self.busy() {
            return Err(FitError::fit_in_progress());
        }

        self.model.init()?;

        let n_regions = self.data.n_regions_total();
        if n_regions == 0 {
            return Err(FitError::data("No regions in data."));
        }

        let mut n_thread = self.settings.n_thread.max(1);
        let max_px = self.data.max_px_per_image();
        if n_thread > max_px && max_px > 0 {
            n_thread = max_px;
        }

        // Only create as many fitters as there are independent units.
        self.n_fitters = match self.settings.coupling {
            CouplingMode::Pixelwise => n_thread.min(self.data.max_region_size().max(1)),
            _ => n_thread.min(n_regions),
        };

        let (n_units, n_slots, slot_offsets) = match self.settings.coupling {
            CouplingMode::Pixelwise => {
                let mut offsets = vec![0; n_regions];
                let mut running = 0;
                for im in 0..self.data.n_im_used() {
                    for label in 1..=self.data.max_region_label() {
                        if let Some(idx) = self.data.region_index(Some(im), label) {
                            offsets[idx] = running;
                            running += self.data.region_count(Some(im), label);
                        }
                    }
                }
                (self.data.n_masked_px(), running, offsets)
            }
            _ => (n_regions, n_regions, Vec::new()),
        };
        self.status.set_n_region(n_units);
        self.slot_offsets = Arc::new(slot_offsets);

        self.results = Some(Arc::new(FitResults::new(
            n_slots,
            self.model.nonlinear_output_names(),
            self.model.linear_output_names(),
        )));

        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| FitError::numeric(format!("Normal distribution error: {e}")))?;
        self.conf_factor = normal.inverse_cdf(1.0 - 0.5 * self.settings.confidence_interval);

        self.initialised = true;
        info!(
            n_fitters = self.n_fitters,
            n_regions,
            coupling = ?self.settings.coupling,
            "controller initialised"
        );
        Ok(())
    }

    /// Start the fit. Blocks until completion unless `run_async` is set.
    pub fn run_workers(&mut self) -> Result<(), FitError> {
        if !self.initialised {
            return Err(FitError::not_initialised());
        }
        if self.status.is_running() {
            return Err(FitError::fit_in_progress());
        }
        if self.status.is_terminating() {
            return Ok(());
        }

        // Join any workers left from a previous async run.
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        let sched = Arc::new(SchedState::new(self.n_fitters));
        self.sched = Some(Arc::clone(&sched));

        let ctx = WorkerCtx {
            data: Arc::clone(&self.data),
            results: Arc::clone(self.results.as_ref().expect("initialised")),
            status: Arc::clone(&self.status),
            sched,
            model: self.model.clone(),
            settings: self.settings.clone(),
            conf_factor: self.conf_factor,
            n_fitters: self.n_fitters,
            slot_offsets: Arc::clone(&self.slot_offsets),
        };

        self.status.reset_progress();
        self.status.set_state(RunState::Running);
        info!(n_fitters = self.n_fitters, "starting fit workers");

        if self.n_fitters == 1 && !self.settings.run_async {
            worker_thread(0, ctx);
            return Ok(());
        }

        for thread in 0..self.n_fitters {
            let ctx = ctx.clone();
            self.workers
                .push(std::thread::spawn(move || worker_thread(thread, ctx)));
        }

        if !self.settings.run_async {
            for handle in self.workers.drain(..) {
                let _ = handle.join();
            }
        }
        Ok(())
    }

    /// Block until a run finishes; returns the terminal state.
    pub fn wait(&mut self) -> RunState {
        let state = self.status.wait_idle();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        state
    }
}

impl Drop for FitController {
    fn drop(&mut self) {
        // Workers borrow shared model/data state through their own Arcs,
        // but joining here keeps scratch lifetimes strictly inside the
        // controller's.
        self.stop_fit();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_thread(thread: usize, ctx: WorkerCtx) {
    ctx.status.add_thread();
    let mut fitter = RegionFitter::new(ctx.model.clone(), &ctx.settings, ctx.conf_factor);

    match ctx.settings.coupling {
        CouplingMode::Pixelwise => run_pixelwise(thread, &ctx, &mut fitter),
        CouplingMode::Imagewise => run_imagewise(thread, &ctx, &mut fitter),
        CouplingMode::Global => run_global(thread, &ctx, &mut fitter),
    }

    let remaining = ctx.status.remove_thread();
    if remaining == 0 {
        // Last one out publishes the terminal state exactly once.
        let state = if ctx.status.is_terminating() {
            RunState::Terminated
        } else {
            RunState::Completed
        };
        info!(?state, "fit run finished");
        ctx.status.set_state(state);
    }
}

/// All threads cooperatively process the same region's pixels; thread 0
/// stages each region's data and releases the followers.
fn run_pixelwise(thread: usize, ctx: &WorkerCtx, fitter: &mut RegionFitter) {
    let n_active = ctx.n_fitters;
    let token = ctx.status.token();
    let n_meas = ctx.model.n_meas();

    // Intra-fit parallelism: with a single worker the pixel loop fans out
    // over a private rayon pool instead.
    let pool = (ctx.n_fitters == 1 && ctx.settings.n_inner_thread > 1)
        .then(|| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(ctx.settings.n_inner_thread)
                .build()
                .ok()
        })
        .flatten();

    let max_label = ctx.data.max_region_label();
    'regions: for im in 0..ctx.data.n_im_used() {
        for label in 1..=max_label {
            let Some(region_idx) = ctx.data.region_index(Some(im), label) else {
                continue;
            };
            let seq = (im * max_label as usize + (label as usize - 1)) as i64;

            if thread > 0 {
                // Wait until the leader has staged the region we need.
                let mut inner = ctx.sched.inner.lock().expect("scheduler lock");
                while seq > inner.cur_region && !ctx.status.is_terminating() {
                    inner = ctx.sched.cv.wait(inner).expect("scheduler lock");
                }
                if ctx.status.is_terminating() {
                    break 'regions;
                }
                inner.threads_active += 1;
                inner.threads_started += 1;
            } else {
                // Wait until every follower is done with the previous
                // region, then stage the next one.
                let mut inner = ctx.sched.inner.lock().expect("scheduler lock");
                while (inner.threads_active > 0
                    || (inner.threads_started < n_active && inner.cur_region >= 0))
                    && !ctx.status.is_terminating()
                {
                    inner = ctx.sched.cv.wait(inner).expect("scheduler lock");
                }
                if ctx.status.is_terminating() {
                    break 'regions;
                }

                {
                    let mut buf = ctx.sched.region_buf.write().expect("region buffer");
                    if ctx.data.region_data(0, Some(im), label, &mut buf).is_err() {
                        buf.clear();
                    }
                }

                inner.cur_region = seq;
                inner.threads_active = 1;
                inner.threads_started = 1;
                ctx.sched.cv.notify_all();
            }

            // Process this thread's contiguous pixel chunk.
            let mut terminated = false;
            {
                let buf = ctx.sched.region_buf.read().expect("region buffer");
                let count = buf.n_px;
                let per_thread = count.div_ceil(n_active.max(1)).max(1);
                let start = (per_thread * thread).min(count);
                let end = (per_thread * (thread + 1)).min(count);

                if let Some(pool) = &pool {
                    let buf = &*buf;
                    pool.install(|| {
                        use rayon::prelude::*;
                        (start..end).into_par_iter().for_each_init(
                            || RegionFitter::new(ctx.model.clone(), &ctx.settings, ctx.conf_factor),
                            |px_fitter, px| {
                                if ctx.status.is_terminating() {
                                    return;
                                }
                                fit_one_pixel(ctx, px_fitter, buf, region_idx, px, n_meas, &token);
                            },
                        );
                    });
                    terminated = ctx.status.is_terminating();
                } else {
                    for px in start..end {
                        if ctx.status.is_terminating() {
                            terminated = true;
                            break;
                        }
                        fit_one_pixel(ctx, fitter, &buf, region_idx, px, n_meas, &token);
                    }
                }
            }

            {
                let mut inner = ctx.sched.inner.lock().expect("scheduler lock");
                inner.threads_active -= 1;
                ctx.sched.cv.notify_all();
            }
            if terminated {
                break 'regions;
            }
        }
    }
}

fn fit_one_pixel(
    ctx: &WorkerCtx,
    fitter: &mut RegionFitter,
    buf: &RegionData,
    region_idx: usize,
    px: usize,
    n_meas: usize,
    token: &crate::domain::CancellationToken,
) {
    let pixel_region = RegionData {
        image: buf.image,
        label: buf.label,
        region_index: buf.region_index,
        n_px: 1,
        decays: buf.decay(px, n_meas).to_vec(),
        pixels: vec![buf.pixels[px]],
    };
    let mut result = fitter.fit_region(&pixel_region, token);
    result.pixel = Some(px);
    ctx.results.set(ctx.slot_offsets[region_idx] + px, result);
    ctx.status.region_processed();
}

/// Work-stealing over regions: a shared counter hands out the next
/// unprocessed region index to whichever thread asks first.
fn run_imagewise(thread: usize, ctx: &WorkerCtx, fitter: &mut RegionFitter) {
    let token = ctx.status.token();
    let total = ctx.data.n_regions_total();
    let max_label = ctx.data.max_region_label();
    let mut im0 = 0;
    let mut buf = RegionData::default();

    'claims: loop {
        if ctx.status.is_terminating() {
            break;
        }

        let process_idx = {
            let mut inner = ctx.sched.inner.lock().expect("scheduler lock");
            if inner.next_region >= total {
                None
            } else {
                let idx = inner.next_region;
                inner.next_region += 1;
                Some(idx)
            }
        };
        let Some(process_idx) = process_idx else {
            break;
        };

        // Region indices are dense and ordered by image, so the scan can
        // resume from the image the last claim landed in.
        for im in im0..ctx.data.n_im_used() {
            for label in 1..=max_label {
                if ctx.status.is_terminating() {
                    break 'claims;
                }
                if ctx.data.region_index(Some(im), label) != Some(process_idx) {
                    continue;
                }

                update_image_marker(ctx, thread, im as i64);

                if ctx.data.region_data(thread, Some(im), label, &mut buf).is_ok() {
                    let result = fitter.fit_region(&buf, &token);
                    ctx.results.set(process_idx, result);
                }
                ctx.status.region_processed();

                im0 = im;
                continue 'claims;
            }
        }
        // Counter outran the region table; nothing left for us.
        break;
    }

    update_image_marker(ctx, thread, -1);
}

/// Track the lowest image any thread still needs so earlier images could
/// be released upstream.
fn update_image_marker(ctx: &WorkerCtx, thread: usize, im: i64) {
    let mut inner = ctx.sched.inner.lock().expect("scheduler lock");
    inner.cur_im[thread] = im;
    let mut release = i64::MAX;
    for &m in &inner.cur_im {
        if m >= 0 && m < release {
            release = m;
        }
    }
    if release != i64::MAX {
        inner.releasable_below = release;
        debug!(releasable_below = release, "image release watermark");
    }
}

/// Static partition: thread `t` owns every region with
/// `region_index % n_fitters == t`, fitted jointly across images.
fn run_global(thread: usize, ctx: &WorkerCtx, fitter: &mut RegionFitter) {
    let token = ctx.status.token();
    let mut buf = RegionData::default();

    for label in 1..=ctx.data.max_region_label() {
        if ctx.status.is_terminating() {
            break;
        }
        let Some(idx) = ctx.data.region_index(None, label) else {
            continue;
        };
        if idx % ctx.n_fitters != thread {
            continue;
        }

        if ctx.data.region_data(thread, None, label, &mut buf).is_ok() {
            let result = fitter.fit_region(&buf, &token);
            ctx.results.set(idx, result);
        }
        ctx.status.region_processed();
    }
}
