//! Application bootstrap and dependency wiring.
//!
//! The single composition root: every process-wide service (shared timers,
//! token manager, circuit breaker, coworker directory, source hub,
//! resource manager, async worker, HLS controller) is constructed and
//! wired here, then carried as fields of [`Services`]. Nothing else in the
//! crate reaches for a global.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::api::AppState;
use crate::breaker::{CircuitBreaker, ProcSelfStat};
use crate::clock::{Clock, TokioClock};
use crate::config::Config;
use crate::conn::rtmp::RtmpListener;
use crate::conn::ts_udp::TsUdpCaster;
use crate::conn::AdapterContext;
use crate::context::{ContextId, NetworkContext};
use crate::coworkers::CoworkerDirectory;
use crate::error::{ServerError, ServerResult};
use crate::heartbeat::{Heartbeat, ListenSummary};
use crate::hls::muxer::HlsController;
use crate::hls::session::HlsSessionStore;
use crate::hub::{LiveSourceRegistry, RtcSourceRegistry, SourceEvents, SrtSourceRegistry};
use crate::pithy::PithyPrints;
use crate::request::StreamRequest;
use crate::resource::ResourceManager;
use crate::runtime::async_call::AsyncCallWorker;
use crate::runtime::coroutine::{Coroutine, TaskSpawner, TokioSpawner};
use crate::runtime::timer::{FastTimerHandler, Hourglass, SharedTimers};
use crate::token::PublishTokenManager;

const HOURGLASS_RESOLUTION: Duration = Duration::from_secs(1);
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Container for all bootstrapped services.
pub struct Services {
    pub config: Config,
    pub network: NetworkContext,
    pub clock: Arc<dyn Clock>,
    pub spawner: Arc<dyn TaskSpawner>,
    pub timers: Arc<SharedTimers>,
    pub hourglass: Arc<Hourglass>,
    pub async_worker: Arc<AsyncCallWorker>,
    pub tokens: Arc<PublishTokenManager>,
    pub events: Arc<SourceEvents>,
    pub live: Arc<LiveSourceRegistry>,
    pub rtc: Arc<RtcSourceRegistry>,
    pub srt: Arc<SrtSourceRegistry>,
    pub prints: Arc<PithyPrints>,
    pub breaker: Arc<CircuitBreaker>,
    pub coworkers: Arc<CoworkerDirectory>,
    pub heartbeat: Arc<Heartbeat>,
    pub hls_controller: Arc<HlsController>,
    pub sessions: Arc<HlsSessionStore>,
    pub conn_manager: Arc<ResourceManager>,
    http_client: Client,
    listener_cos: parking_lot::Mutex<Vec<Arc<Coroutine>>>,
}

/// Creates the shared HTTP client (heartbeat and future callbacks).
fn create_http_client() -> Client {
    Client::builder()
        .timeout(HTTP_CLIENT_TIMEOUT)
        .build()
        .expect("Failed to create HTTP client")
}

/// Bootstraps all services with their dependencies.
///
/// Wiring order matters: leaves first (clock, spawner, timers), then the
/// hub, then everything subscribing to hub events or timers.
pub fn bootstrap_services(config: Config, network: NetworkContext) -> ServerResult<Services> {
    config
        .validate()
        .map_err(ServerError::Configuration)?;

    let clock: Arc<dyn Clock> = TokioClock::arc();
    let spawner: Arc<dyn TaskSpawner> = Arc::new(TokioSpawner::current());
    let http_client = create_http_client();

    let timers = SharedTimers::new();
    let hourglass = Hourglass::new("services", HOURGLASS_RESOLUTION);
    let async_worker = Arc::new(AsyncCallWorker::new());
    let tokens = PublishTokenManager::new();

    let events = SourceEvents::new();
    let live = LiveSourceRegistry::new(config.consumer, Arc::clone(&events));
    let rtc = RtcSourceRegistry::new(config.consumer, Arc::clone(&events));
    let srt = SrtSourceRegistry::new(config.consumer.max_count, Arc::clone(&events));

    let prints = PithyPrints::new(config.pithy_interval, Arc::clone(&clock));
    let breaker = CircuitBreaker::new(config.breaker, ProcSelfStat::new());

    let coworkers = CoworkerDirectory::new(
        network.clone(),
        config.listen_host.clone(),
        config.rtmp_listen,
        config.api_port,
    );
    events.subscribe(Arc::clone(&coworkers) as _);

    let hls_controller = HlsController::new(
        config.hls.clone(),
        Arc::clone(&live),
        Arc::clone(&spawner),
        Arc::clone(&async_worker),
    );
    events.subscribe(Arc::clone(&hls_controller) as _);

    let sessions = HlsSessionStore::new(config.hls_session_timeout, Arc::clone(&clock));

    let heartbeat = Heartbeat::new(
        config.heartbeat.clone(),
        network.clone(),
        listens_of(&config),
        http_client.clone(),
    );

    let conn_manager = Arc::new(ResourceManager::new("conns"));

    Ok(Services {
        config,
        network,
        clock,
        spawner,
        timers,
        hourglass,
        async_worker,
        tokens,
        events,
        live,
        rtc,
        srt,
        prints,
        breaker,
        coworkers,
        heartbeat,
        hls_controller,
        sessions,
        conn_manager,
        http_client,
        listener_cos: parking_lot::Mutex::new(Vec::new()),
    })
}

fn listens_of(config: &Config) -> ListenSummary {
    let mut listens = ListenSummary {
        rtmp: vec![config.rtmp_listen.to_string()],
        http: vec![config.http_listen.to_string()],
        api: vec![config.api_port.to_string()],
        srt: Vec::new(),
    };
    if config.srt_listen != 0 {
        listens.srt.push(config.srt_listen.to_string());
    }
    listens
}

impl Services {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Starts the background machinery: timers, workers, subscriptions.
    pub fn start_background_tasks(&self) {
        self.timers.start(self.spawner.as_ref());
        self.async_worker.start(self.spawner.as_ref());
        self.conn_manager.start(self.spawner.as_ref());

        // Periodic subscribers.
        self.timers
            .timer1s()
            .subscribe(&(Arc::clone(&self.breaker) as Arc<dyn FastTimerHandler>));
        self.timers
            .timer5s()
            .subscribe(&(Arc::clone(&self.sessions) as Arc<dyn FastTimerHandler>));

        self.heartbeat.schedule(&self.hourglass);
        self.hourglass.start(
            self.spawner.as_ref(),
            Arc::clone(&self.heartbeat) as _,
        );

        tracing::info!("Background tasks started");
    }

    /// The shared context handed to every connection adapter.
    pub fn adapter_context(&self) -> AdapterContext {
        let vhost = self.config.vhost(crate::request::DEFAULT_VHOST);
        AdapterContext {
            live: Arc::clone(&self.live),
            rtc: Arc::clone(&self.rtc),
            srt: Arc::clone(&self.srt),
            tokens: Arc::clone(&self.tokens),
            prints: Arc::clone(&self.prints),
            breaker: Arc::clone(&self.breaker),
            spawner: Arc::clone(&self.spawner),
            clock: Arc::clone(&self.clock),
            rtmp_to_rtc: vhost.rtmp_to_rtc,
        }
    }

    /// State for the HTTP endpoint.
    pub fn app_state(&self) -> AppState {
        AppState {
            adapter: self.adapter_context(),
            sessions: Arc::clone(&self.sessions),
            coworkers: Arc::clone(&self.coworkers),
            hls: self.config.hls.clone(),
            network: self.network.clone(),
        }
    }

    /// Spawns the RTMP listener coroutine.
    pub fn start_rtmp_listener(&self) {
        let listener = RtmpListener::new(
            self.adapter_context(),
            self.config.rtmp_listen,
            Arc::clone(&self.conn_manager),
        );
        let co = Coroutine::new("rtmp-listener", ContextId::new());
        let run_co = Arc::clone(&co);
        self.spawner.spawn(Box::pin(async move {
            if let Err(err) = listener.serve(run_co).await {
                if !err.is_interrupted() {
                    log::error!("[Bootstrap] rtmp listener: {}", err);
                }
            }
        }));
        self.listener_cos.lock().push(co);
    }

    /// Spawns the MPEG-TS/UDP caster coroutine when configured.
    pub fn start_ts_caster(&self) {
        if self.config.srt_listen == 0 {
            return;
        }
        let (app, stream) = self.config.srt_app_stream();
        let req = StreamRequest::new(
            "srt",
            self.network.get_local_ip(),
            app,
            stream,
            self.config.srt_listen,
        );
        let caster = TsUdpCaster::new(
            self.adapter_context(),
            req,
            Arc::clone(&self.clock),
            self.config.srt_listen,
        );
        let co = Coroutine::new("ts-caster", ContextId::new());
        let run_co = Arc::clone(&co);
        self.spawner.spawn(Box::pin(async move {
            if let Err(err) = caster.serve(run_co).await {
                if !err.is_interrupted() {
                    log::error!("[Bootstrap] ts caster: {}", err);
                }
            }
        }));
        self.listener_cos.lock().push(co);
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        tracing::info!("Beginning graceful shutdown");

        for co in self.listener_cos.lock().iter() {
            co.stop();
        }
        tracing::debug!("listeners stopped");
        self.hourglass.stop();
        self.async_worker.stop().await;
        self.conn_manager.stop().await;
        self.timers.stop();

        tracing::info!("Shutdown complete");
    }
}
