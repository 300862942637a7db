//! Module implement the range server facade.
//!
//! [RangeServer] wires together the server [Context], the update
//! pipeline, the maintenance scheduler, scanners and phantom range
//! recovery, and exposes the inbound request surface as methods.
//! [Dispatcher] serves the same surface from a pool of worker threads,
//! taking [Request] values and answering with [Response] values.

use log::{debug, error, info, warn};

use std::{
    collections::BTreeMap,
    panic,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        mpsc, Arc, RwLock,
    },
    time,
};

use crate::{
    config::Config,
    context::Context,
    error::code,
    mutator::{RangeLocator, RangeSender},
    query_cache::QueryCache,
    range::{
        maintenance::{self, MaintenanceFlag, Scheduler},
        Range,
    },
    recovery::{self, params::PhantomUpdate, MasterClient, QualifiedRangeSpec, Recovery},
    scan::{ScanBlock, ScanSpec, ScannerMap},
    state::ServerState,
    table::{RangeSpec, Schema, TableIdentifier, TableInfo},
    update::{ResponseSink, UpdatePipeline, UpdateRequest, UpdateResponse, FORCE_SYNC},
    util::thread::{Pool, Rx},
    Error, Result,
};

/// Range server, shutdown with [RangeServer::close].
pub struct RangeServer {
    // fields are dropped in declaration order, pipeline ahead of the
    // scheduler it posts to.
    pipeline: UpdatePipeline,
    scheduler: Scheduler,
    ctx: Arc<Context>,
    recovery: Recovery,
    scanners: ScannerMap,
    next_id: AtomicU64,
}

impl RangeServer {
    /// Start a range server at `location`, completion of recovery steps
    /// are notified to `master`.
    pub fn new(location: &str, config: Config, master: Arc<dyn MasterClient>) -> Result<RangeServer> {
        let scanners = ScannerMap::new(config.scanner_block_size);
        let ctx = Arc::new(Context::new(location, config)?);
        let scheduler = Scheduler::new(Arc::clone(&ctx))?;
        let pipeline = UpdatePipeline::new(Arc::clone(&ctx), Some(scheduler.to_tx()?))?;

        info!(target: "rangesrv", "{}, range server started", location);
        Ok(RangeServer {
            pipeline,
            scheduler,
            ctx,
            recovery: Recovery::new(master),
            scanners,
            next_id: AtomicU64::new(1),
        })
    }

    /// Stop the pipeline and the scheduler and close commit logs.
    pub fn close(self) -> Result<()> {
        let RangeServer {
            pipeline,
            scheduler,
            ctx,
            ..
        } = self;
        pipeline.close()?;
        scheduler.close()?;
        ctx.close()?;
        info!(target: "rangesrv", "{}, range server stopped", ctx.location);
        Ok(())
    }

    pub fn to_location(&self) -> String {
        self.ctx.location.clone()
    }

    pub fn as_context(&self) -> &Context {
        &self.ctx
    }

    /// Replay system and user commit logs into loaded ranges, typically
    /// after loading tables and ranges on restart. Return the number of
    /// cells replayed.
    pub fn replay_commit_logs(&self) -> Result<usize> {
        let config = &self.ctx.config;
        let mut n = 0;
        for log_dir in [config.to_system_log_dir(), config.to_user_log_dir()].iter() {
            n += recovery::replay_commit_log(&self.ctx, log_dir)?;
        }
        for info in self.ctx.tables.to_tables()?.into_iter() {
            n += recovery::recover_transfer_logs(&self.ctx, &info.to_identifier()?)?;
        }
        Ok(n)
    }
}

// updates and scans.
impl RangeServer {
    /// Submit `count` serialized mutations for `table`, the response is
    /// delivered through `sink`.
    pub fn update_async(
        &self,
        table: TableIdentifier,
        buffer: Vec<u8>,
        count: u32,
        flags: u32,
        sink: Box<dyn ResponseSink>,
    ) -> Result<u64> {
        let id = self.next_id.fetch_add(1, SeqCst);
        let timeout = self.ctx.config.request_timeout;
        let request = UpdateRequest::new(id, table, buffer, count, flags, timeout, sink);
        debug!(target: "rangesrv", "{}, submit {:?}", self.ctx.location, request);
        self.pipeline.submit(request)?;
        Ok(id)
    }

    /// Apply `count` serialized mutations to `table` and wait for the
    /// response.
    pub fn update(
        &self,
        table: TableIdentifier,
        buffer: Vec<u8>,
        count: u32,
        flags: u32,
    ) -> Result<UpdateResponse> {
        let (tx, rx) = mpsc::channel::<UpdateResponse>();
        self.update_async(table, buffer, count, flags, Box::new(tx))?;
        self.wait_response(rx)
    }

    /// Sync the commit log for `table`, after all updates submitted so
    /// far.
    pub fn commit_log_sync(&self, table: TableIdentifier) -> Result<UpdateResponse> {
        self.update(table, vec![], 0, FORCE_SYNC)
    }

    fn wait_response(&self, rx: mpsc::Receiver<UpdateResponse>) -> Result<UpdateResponse> {
        // give the pipeline a chance to answer expired requests itself.
        let timeout = self.ctx.config.request_timeout * 2;
        match rx.recv_timeout(timeout) {
            Ok(resp) => Ok(resp),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                err_at!(Timeout, msg: "no update response after {:?}", timeout)
            }
            Err(err) => err_at!(IPCFail, msg: "update response {}", err),
        }
    }

    /// Scan `range` of `table` and return the first block of cells. When
    /// more cells follow, the block carries a scanner id to fetch them.
    pub fn create_scanner(
        &self,
        table: &TableIdentifier,
        range: &RangeSpec,
        spec: &ScanSpec,
    ) -> Result<ScanBlock> {
        let info = self.to_table_info(&table.id)?;
        let generation = info.to_schema()?.generation;
        if table.generation != generation {
            err_at!(
                GenerationMismatch,
                msg: "{} scan, schema generation is {}", table, generation
            )?
        }
        let r = match info.get_range(range)? {
            Some(r) => r,
            None => err_at!(RangeNotFound, msg: "{}{} not loaded", table.id, range)?,
        };
        if let Some(err) = r.to_error()? {
            return Err(err);
        }

        // system tables change under the cache's feet, never cache them.
        let cacheable = spec.is_single_row() && !table.is_system();
        let cells = match (&self.ctx.query_cache, cacheable) {
            (Some(cache), true) => {
                let key = QueryCache::to_key(table, spec)?;
                match cache.lookup(key)? {
                    Some(cells) => cells,
                    None => {
                        let cells = r.scan(spec)?;
                        let row = &spec.start_row;
                        cache.insert(key, &table.id, row, &spec.families, cells.clone())?;
                        cells
                    }
                }
            }
            _ => r.scan(spec)?,
        };
        self.scanners.create(table.clone(), range.clone(), cells)
    }

    pub fn fetch_scanblock(&self, scanner_id: u32) -> Result<ScanBlock> {
        self.scanners.fetch(scanner_id)
    }

    pub fn destroy_scanner(&self, scanner_id: u32) -> Result<()> {
        self.scanners.destroy(scanner_id)
    }

    /// Remove scanners idle for longer than `ttl`.
    pub fn purge_scanners(&self, ttl: time::Duration) -> Result<usize> {
        let n = self.scanners.purge_idle(ttl)?;
        if n > 0 {
            info!(target: "rangesrv", "{}, purged {} idle scanners", self.ctx.location, n);
        }
        Ok(n)
    }
}

// phantom range recovery.
impl RangeServer {
    pub fn phantom_load(
        &self,
        op_id: i64,
        location: &str,
        plan_generation: i32,
        fragments: &[u32],
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        self.recovery
            .load(&self.ctx, op_id, location, plan_generation, fragments, specs)
    }

    /// Return true if `update` completed a fragment and got applied.
    pub fn phantom_update(&self, update: &PhantomUpdate) -> Result<bool> {
        self.recovery.update(&self.ctx, update)
    }

    pub fn phantom_prepare_ranges(
        &self,
        op_id: i64,
        location: &str,
        plan_generation: i32,
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        self.recovery
            .prepare(&self.ctx, op_id, location, plan_generation, specs)
    }

    pub fn phantom_commit_ranges(
        &self,
        op_id: i64,
        location: &str,
        plan_generation: i32,
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        self.recovery
            .commit(&self.ctx, op_id, location, plan_generation, specs)
    }
}

// administration.
impl RangeServer {
    fn to_table_info(&self, table_id: &str) -> Result<Arc<TableInfo>> {
        match self.ctx.tables.get(table_id)? {
            Some(info) => Ok(info),
            None => err_at!(TableNotFound, msg: "table {}", table_id),
        }
    }

    fn to_range(&self, table_id: &str, spec: &RangeSpec) -> Result<(Arc<TableInfo>, Arc<Range>)> {
        let info = self.to_table_info(table_id)?;
        match info.get_range(spec)? {
            Some(range) => Ok((info, range)),
            None => err_at!(RangeNotFound, msg: "{}{} not loaded", table_id, spec),
        }
    }

    /// Create table `table_id` with `schema`, or install `schema` on an
    /// existing table.
    pub fn create_table(&self, table_id: &str, schema: Schema) -> Result<()> {
        let generation = schema.generation;
        let info = self.ctx.tables.get_or_insert(table_id, schema.clone())?;
        if info.to_schema()?.generation != generation {
            info.update_schema(schema)?;
        }
        info!(target: "rangesrv", "table {} schema generation {}", table_id, generation);
        Ok(())
    }

    /// Load range `spec` of `table` from its range directory. Loading an
    /// already loaded range is a no-op.
    pub fn load_range(&self, table: &TableIdentifier, spec: &RangeSpec) -> Result<()> {
        let info = self.to_table_info(&table.id)?;
        if info.get_range(spec)?.is_some() {
            debug!(target: "rangesrv", "{}{}, already loaded", table.id, spec);
            return Ok(());
        }
        let range_dir = self.ctx.to_range_dir(&table.id, &spec.end_row);
        let range = Range::new(table.clone(), spec.clone(), &range_dir)?;
        info.add_range(Arc::new(range))
    }

    /// Drop table `table_id` along with all its ranges and their files.
    pub fn drop_table(&self, table_id: &str) -> Result<()> {
        let info = self.to_table_info(table_id)?;
        info.set_maintenance_disabled(true);
        for range in info.to_ranges()?.into_iter() {
            maintenance::drop_range(&info, &range)?;
        }
        self.ctx.tables.remove(table_id)?;
        info!(target: "rangesrv", "table {} dropped", table_id);
        Ok(())
    }

    /// Compact ranges of `table_id` as per `flags`, all of them when
    /// `spec` is None. Return the number of ranges compacted.
    pub fn compact(
        &self,
        table_id: &str,
        spec: Option<&RangeSpec>,
        flags: MaintenanceFlag,
    ) -> Result<usize> {
        let ranges = match spec {
            Some(spec) => vec![self.to_range(table_id, spec)?.1],
            None => self.to_table_info(table_id)?.to_ranges()?,
        };
        for range in ranges.iter() {
            maintenance::compact(&self.ctx, range, flags)?;
        }
        maintenance::purge_commit_logs(&self.ctx)?;
        Ok(ranges.len())
    }

    /// Split range `spec` of `table_id`. Return the split-off lower
    /// range, None when the range is too small to split.
    pub fn split(&self, table_id: &str, spec: &RangeSpec) -> Result<Option<RangeSpec>> {
        let (info, range) = self.to_range(table_id, spec)?;
        match maintenance::split(&self.ctx, &info, &range)? {
            Some(new_range) => Ok(Some(new_range.to_spec()?)),
            None => Ok(None),
        }
    }

    /// Resume scheduled maintenance on ranges of `table_id`.
    pub fn table_maintenance_enable(&self, table_id: &str) -> Result<()> {
        self.to_table_info(table_id)?.set_maintenance_disabled(false);
        info!(target: "rangesrv", "table {} maintenance enabled", table_id);
        Ok(())
    }

    /// Stop scheduled maintenance on ranges of `table_id`, returns after
    /// maintenance in progress on those ranges completes.
    pub fn table_maintenance_disable(&self, table_id: &str) -> Result<()> {
        let info = self.to_table_info(table_id)?;
        info.set_maintenance_disabled(true);
        for range in info.to_ranges()?.into_iter() {
            range.as_guard().wait_for_complete(false)?;
        }
        info!(target: "rangesrv", "table {} maintenance disabled", table_id);
        Ok(())
    }

    pub fn to_state(&self) -> Result<Arc<ServerState>> {
        self.ctx.state.to_snapshot()
    }

    /// Publish `state`, based on the snapshot whose generation it carries.
    /// Fails with GenerationMismatch if the state changed meanwhile.
    pub fn set_state(&self, state: ServerState) -> Result<Arc<ServerState>> {
        let state = self.ctx.state.compare_and_set(state)?;
        if !state.maintenance_disabled {
            self.scheduler.check()?;
        }
        Ok(state)
    }
}

/// In-process transport to a set of range servers, locating rows by
/// asking each server for its loaded ranges.
#[derive(Default)]
pub struct LocalSender {
    servers: RwLock<BTreeMap<String, Arc<RangeServer>>>,
}

impl LocalSender {
    pub fn new() -> LocalSender {
        LocalSender::default()
    }

    pub fn add_server(&self, server: Arc<RangeServer>) -> Result<()> {
        let mut servers = err_at!(Fatal, self.servers.write())?;
        servers.insert(server.to_location(), server);
        Ok(())
    }

    pub fn remove_server(&self, location: &str) -> Result<Option<Arc<RangeServer>>> {
        Ok(err_at!(Fatal, self.servers.write())?.remove(location))
    }
}

impl RangeLocator for LocalSender {
    fn locate(&self, table: &TableIdentifier, row: &[u8]) -> Result<String> {
        let servers = err_at!(Fatal, self.servers.read())?;
        for (location, server) in servers.iter() {
            if let Some(info) = server.ctx.tables.get(&table.id)? {
                if info.find_containing_range(row)?.is_some() {
                    return Ok(location.clone());
                }
            }
        }
        err_at!(OutOfRange, msg: "{} row {:?} not located", table, String::from_utf8_lossy(row))
    }

    fn invalidate(&self, _table: &TableIdentifier, _row: &[u8]) {}
}

impl RangeSender for LocalSender {
    fn send(
        &self,
        addr: &str,
        table: &TableIdentifier,
        buffer: Vec<u8>,
        count: u32,
        flags: u32,
    ) -> Result<UpdateResponse> {
        let server = match err_at!(Fatal, self.servers.read())?.get(addr) {
            Some(server) => Arc::clone(server),
            None => err_at!(IPCFail, msg: "no server at {}", addr)?,
        };
        server.update(table.clone(), buffer, count, flags)
    }
}

/// Requests served by [Dispatcher].
#[derive(Clone, Debug)]
pub enum Request {
    Update {
        table: TableIdentifier,
        buffer: Vec<u8>,
        count: u32,
        flags: u32,
    },
    CreateScanner {
        table: TableIdentifier,
        range: RangeSpec,
        spec: ScanSpec,
    },
    FetchScanblock {
        scanner_id: u32,
    },
    DestroyScanner {
        scanner_id: u32,
    },
    CommitLogSync {
        table: TableIdentifier,
    },
    PhantomLoad {
        op_id: i64,
        location: String,
        plan_generation: i32,
        fragments: Vec<u32>,
        specs: Vec<QualifiedRangeSpec>,
    },
    PhantomUpdate(PhantomUpdate),
    PhantomPrepareRanges {
        op_id: i64,
        location: String,
        plan_generation: i32,
        specs: Vec<QualifiedRangeSpec>,
    },
    PhantomCommitRanges {
        op_id: i64,
        location: String,
        plan_generation: i32,
        specs: Vec<QualifiedRangeSpec>,
    },
    TableMaintenanceEnable {
        table_id: String,
    },
    TableMaintenanceDisable {
        table_id: String,
    },
    Compact {
        table_id: String,
        spec: Option<RangeSpec>,
        flags: MaintenanceFlag,
    },
    Split {
        table_id: String,
        spec: RangeSpec,
    },
    SetState(ServerState),
}

/// Responses from [Dispatcher], handler failures come back as
/// [Response::Error].
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Ok,
    Update(UpdateResponse),
    ScanBlock(ScanBlock),
    Applied(bool),
    Count(usize),
    Split(Option<RangeSpec>),
    State(Arc<ServerState>),
    Error { error: i32, message: String },
}

impl From<Error> for Response {
    fn from(err: Error) -> Response {
        Response::Error {
            error: err.to_code(),
            message: err.to_message(),
        }
    }
}

impl Response {
    pub fn to_error(&self) -> i32 {
        match self {
            Response::Error { error, .. } => *error,
            Response::Update(resp) => resp.error,
            _ => code::OK,
        }
    }
}

impl RangeServer {
    /// Serve `req`.
    pub fn handle(&self, req: Request) -> Result<Response> {
        let resp = match req {
            Request::Update {
                table,
                buffer,
                count,
                flags,
            } => Response::Update(self.update(table, buffer, count, flags)?),
            Request::CreateScanner { table, range, spec } => {
                Response::ScanBlock(self.create_scanner(&table, &range, &spec)?)
            }
            Request::FetchScanblock { scanner_id } => {
                Response::ScanBlock(self.fetch_scanblock(scanner_id)?)
            }
            Request::DestroyScanner { scanner_id } => {
                self.destroy_scanner(scanner_id)?;
                Response::Ok
            }
            Request::CommitLogSync { table } => Response::Update(self.commit_log_sync(table)?),
            Request::PhantomLoad {
                op_id,
                location,
                plan_generation,
                fragments,
                specs,
            } => {
                self.phantom_load(op_id, &location, plan_generation, &fragments, &specs)?;
                Response::Ok
            }
            Request::PhantomUpdate(update) => Response::Applied(self.phantom_update(&update)?),
            Request::PhantomPrepareRanges {
                op_id,
                location,
                plan_generation,
                specs,
            } => {
                self.phantom_prepare_ranges(op_id, &location, plan_generation, &specs)?;
                Response::Ok
            }
            Request::PhantomCommitRanges {
                op_id,
                location,
                plan_generation,
                specs,
            } => {
                self.phantom_commit_ranges(op_id, &location, plan_generation, &specs)?;
                Response::Ok
            }
            Request::TableMaintenanceEnable { table_id } => {
                self.table_maintenance_enable(&table_id)?;
                Response::Ok
            }
            Request::TableMaintenanceDisable { table_id } => {
                self.table_maintenance_disable(&table_id)?;
                Response::Ok
            }
            Request::Compact {
                table_id,
                spec,
                flags,
            } => Response::Count(self.compact(&table_id, spec.as_ref(), flags)?),
            Request::Split { table_id, spec } => Response::Split(self.split(&table_id, &spec)?),
            Request::SetState(state) => Response::State(self.set_state(state)?),
        };
        Ok(resp)
    }
}

/// Pool of threads serving [Request] values on a [RangeServer].
pub struct Dispatcher {
    pool: Pool<Request, Response, ()>,
}

impl Dispatcher {
    /// Spawn `config.pool_size` dispatcher threads over `server`.
    pub fn new(server: Arc<RangeServer>) -> Result<Dispatcher> {
        let mut pool = Pool::new("dispatcher");
        pool.set_pool_size(server.ctx.config.pool_size);
        pool.spawn(move |rx: Rx<Request, Response>| {
            let server = Arc::clone(&server);
            move || dispatch_loop(server, rx)
        })?;
        info!(target: "rangesrv", "dispatcher started with {} threads", pool.len());
        Ok(Dispatcher { pool })
    }

    /// Serve `req` and wait for its response.
    pub fn request(&self, req: Request) -> Result<Response> {
        self.pool.request(req)
    }

    /// Serve `req`, the response shall be posted on `tx`.
    pub fn request_tx(&self, req: Request, tx: mpsc::Sender<Response>) -> Result<()> {
        self.pool.request_tx(req, tx)
    }

    pub fn close_wait(self) -> Result<()> {
        self.pool.close_wait()?;
        info!(target: "rangesrv", "dispatcher stopped");
        Ok(())
    }
}

fn dispatch_loop(server: Arc<RangeServer>, rx: Rx<Request, Response>) {
    for (req, tx) in rx {
        let name = format!("{:?}", req);
        let res = panic::catch_unwind(panic::AssertUnwindSafe(|| server.handle(req)));
        let resp = match res {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                warn!(target: "rangesrv", "{} failed {}", to_short(&name), err);
                Response::from(err)
            }
            Err(_) => {
                error!(target: "rangesrv", "{} panicked", to_short(&name));
                let res: Result<Response> = err_at!(Fatal, msg: "handler panic {}", to_short(&name));
                res.unwrap_or_else(Response::from)
            }
        };
        if let Some(tx) = tx {
            tx.send(resp).ok();
        }
    }
}

// requests carry mutation buffers, keep log lines short.
fn to_short(name: &str) -> &str {
    match name.char_indices().nth(80) {
        Some((i, _)) => &name[..i],
        None => name,
    }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod server_test;
