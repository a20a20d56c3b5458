use std::{
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use anyhow::{Context as _, Error, Result};
use clap::Parser;
use futures::StreamExt;
use http::StatusCode;
use opentelemetry::{
    metrics::{Histogram, Unit},
    Context, KeyValue,
};
use serde::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::{info, warn};
use url::Url;
use warp::{cors::Cors, filters::BoxedFilter, reply::Response, trace, Filter, Rejection, Reply};

use crate::{
    consensus::ConsensusTable,
    core::{
        error::LogiconError,
        trace::{install_trace_subscriber, TraceConfiguration},
    },
    job::store::InMemoryJobStateStore,
    job_manager::{
        implementation::JobManager,
        interface::types::{
            AppendClientParamsRequest, AppendWorkerParamsRequest, ApiResponse, ClusterQuery,
            ConfigQuery, CreateJobRequest, JobNameRequest, JobStatusQuery,
            UpdateClientStatusRequest, UpdateWorkerStatusRequest,
        },
    },
    params::{HttpParamStore, InMemoryParamStore, ParamStore},
};

//////////////////////////////////////////////////
// main:
pub async fn main() -> anyhow::Result<()>
{
    let options = Options::parse();
    let config = Config::load(&options)?;

    install_trace_subscriber(&config.logging_config)
        .context("failed to install tracing subscriber")?;

    let param_store: Arc<dyn ParamStore> = match &config.param_store
    {
        ParamStoreConfig::InMemory => Arc::new(InMemoryParamStore::new()),
        ParamStoreConfig::Http { url } => Arc::new(HttpParamStore::new(url.clone())?),
    };

    let manager = Arc::new(JobManager::new(
        Arc::new(InMemoryJobStateStore::new()),
        param_store,
        ConsensusTable::with_defaults(),
    ));

    let shutdown_signal =
        setup_signal_handler().context("failed to register SIGTERM signal handler")?;

    let (bound_address, server) = logicon_server(
        manager,
        config.listen_address,
        config.max_body_bytes,
        shutdown_signal,
    )
    .context("failed to create logicon server")?;

    info!(?bound_address, "Running logicon server");
    server.await;
    info!("logicon server stopped");

    Ok(())
}

/// Construct the job manager server, listening on the provided [`SocketAddr`].
/// If the `SocketAddr`'s `port` is 0, an ephemeral port is used. Returns a
/// `SocketAddr` representing the address and port the server is listening on
/// and a future that can be `await`ed to begin serving requests.
pub fn logicon_server(
    manager: Arc<JobManager>,
    listen_address: SocketAddr,
    max_body_bytes: u64,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()> + 'static), Error>
{
    let filter = logicon_filter(manager, max_body_bytes)?;
    let server = warp::serve(filter);
    Ok(server.try_bind_with_graceful_shutdown(listen_address, shutdown_signal)?)
}

/// Resolves once SIGTERM or SIGINT was received.
pub fn setup_signal_handler() -> Result<impl Future<Output = ()> + Send + 'static, std::io::Error>
{
    let mut signal_stream = Signals::new([SIGTERM, SIGINT])?;
    let handle = signal_stream.handle();
    let (sender, receiver) = futures::channel::oneshot::channel();
    let mut sender = Some(sender);

    tokio::spawn(async move {
        while let Some(signal) = signal_stream.next().await
        {
            info!(signal, "received signal, shutting down");
            if let Some(sender) = sender.take()
            {
                // the receiver may already be gone
                let _ = sender.send(());
            }
        }
    });

    Ok(async move {
        let _ = receiver.await;
        handle.close();
    })
}

fn reply<T: Serialize>(response: &ApiResponse<T>) -> Response
{
    warp::reply::with_status(warp::reply::json(response), StatusCode::OK).into_response()
}

fn done(message: &str) -> Response
{
    reply(&ApiResponse::<()>::success(message, None))
}

fn cors(method: &'static str) -> Cors
{
    warp::cors()
        .allow_any_origin()
        .allow_method(method)
        .max_age(CORS_PREFLIGHT_CACHE_AGE)
        .build()
}

pub fn logicon_filter(
    manager: Arc<JobManager>,
    max_body_bytes: u64,
) -> Result<BoxedFilter<(impl Reply,)>, Error>
{
    let meter = opentelemetry::global::meter("logicon");
    let response_time_histogram = meter
        .f64_histogram("logicon_response_time")
        .with_description("Elapsed time handling incoming requests, by endpoint & status.")
        .with_unit(Unit::new("seconds"))
        .init();

    let json_body = move || warp::body::content_length_limit(max_body_bytes);

    //-------------------------------------------------------
    // router description
    let root_routing = warp::path!("job");
    let root_responding = warp::get().then(|| async {
        Ok::<_, LogiconError>(done("This is the 'job-manager' router."))
    });
    let root_endpoint = compose_common_wrappers(
        root_routing,
        root_responding,
        cors("GET"),
        response_time_histogram.clone(),
        "root",
    );

    //-------------------------------------------------------
    // create a job
    let create_routing = warp::path!("job" / "create");
    let create_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(|manager: Arc<JobManager>, request: CreateJobRequest| async move {
            manager
                .handle_create(request)
                .await
                .map(|()| done("Job instance created successfully!"))
        });
    let create_endpoint = compose_common_wrappers(
        create_routing,
        create_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "create",
    );

    //-------------------------------------------------------
    // start a job
    let start_routing = warp::path!("job" / "start");
    let start_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(|manager: Arc<JobManager>, request: JobNameRequest| async move {
            manager
                .handle_start(request)
                .await
                .map(|()| done("Job started successfully!"))
        });
    let start_endpoint = compose_common_wrappers(
        start_routing,
        start_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "start",
    );

    //-------------------------------------------------------
    // get config
    let get_config_routing = warp::path!("job" / "get_config");
    let get_config_responding = warp::get()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(warp::query::<ConfigQuery>())
        .then(|manager: Arc<JobManager>, query: ConfigQuery| async move {
            let config = manager.handle_get_config(query).await?;
            Ok::<_, LogiconError>(reply(&ApiResponse::success(
                "Fetched job config.",
                Some(config),
            )))
        });
    let get_config_endpoint = compose_common_wrappers(
        get_config_routing,
        get_config_responding,
        cors("GET"),
        response_time_histogram.clone(),
        "get_config",
    );

    //-------------------------------------------------------
    // get participants
    let get_participants_routing = warp::path!("job" / "get_participants");
    let get_participants_responding = warp::get()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(warp::query::<ClusterQuery>())
        .then(|manager: Arc<JobManager>, query: ClusterQuery| async move {
            let participants = manager.handle_get_participants(query).await?;
            Ok::<_, LogiconError>(reply(&ApiResponse::success(
                "Fetched job participants.",
                Some(participants),
            )))
        });
    let get_participants_endpoint = compose_common_wrappers(
        get_participants_routing,
        get_participants_responding,
        cors("GET"),
        response_time_histogram.clone(),
        "get_participants",
    );

    //-------------------------------------------------------
    // get job status
    let get_job_status_routing = warp::path!("job" / "get_job_status");
    let get_job_status_responding = warp::get()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(warp::query::<JobStatusQuery>())
        .then(|manager: Arc<JobManager>, query: JobStatusQuery| async move {
            let status = manager.handle_get_job_status(query).await?;
            Ok::<_, LogiconError>(reply(&ApiResponse::success(
                "Fetched job status.",
                Some(status),
            )))
        });
    let get_job_status_endpoint = compose_common_wrappers(
        get_job_status_routing,
        get_job_status_responding,
        cors("GET"),
        response_time_histogram.clone(),
        "get_job_status",
    );

    //-------------------------------------------------------
    // get exec params
    let get_exec_params_routing = warp::path!("job" / "get_exec_params");
    let get_exec_params_responding = warp::get()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(warp::query::<ClusterQuery>())
        .then(|manager: Arc<JobManager>, query: ClusterQuery| async move {
            let exec_params = manager.handle_get_exec_params(query).await?;
            Ok::<_, LogiconError>(reply(&ApiResponse::success(
                "Fetched job exec params.",
                Some(exec_params),
            )))
        });
    let get_exec_params_endpoint = compose_common_wrappers(
        get_exec_params_routing,
        get_exec_params_responding,
        cors("GET"),
        response_time_histogram.clone(),
        "get_exec_params",
    );

    //-------------------------------------------------------
    // append client params
    let append_client_params_routing = warp::path!("job" / "append_client_params");
    let append_client_params_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(
            |manager: Arc<JobManager>, request: AppendClientParamsRequest| async move {
                manager
                    .handle_append_client_params(request)
                    .await
                    .map(|()| done("Client params appended."))
            },
        );
    let append_client_params_endpoint = compose_common_wrappers(
        append_client_params_routing,
        append_client_params_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "append_client_params",
    );

    //-------------------------------------------------------
    // append worker params
    let append_worker_params_routing = warp::path!("job" / "append_worker_params");
    let append_worker_params_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(
            |manager: Arc<JobManager>, request: AppendWorkerParamsRequest| async move {
                manager
                    .handle_append_worker_params(request)
                    .await
                    .map(|()| done("Worker params appended."))
            },
        );
    let append_worker_params_endpoint = compose_common_wrappers(
        append_worker_params_routing,
        append_worker_params_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "append_worker_params",
    );

    //-------------------------------------------------------
    // update client status
    let update_client_status_routing = warp::path!("job" / "update_client_status");
    let update_client_status_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(
            |manager: Arc<JobManager>, request: UpdateClientStatusRequest| async move {
                manager
                    .handle_update_client_status(request)
                    .await
                    .map(|()| done("Client status updated."))
            },
        );
    let update_client_status_endpoint = compose_common_wrappers(
        update_client_status_routing,
        update_client_status_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "update_client_status",
    );

    //-------------------------------------------------------
    // update worker status
    let update_worker_status_routing = warp::path!("job" / "update_worker_status");
    let update_worker_status_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(
            |manager: Arc<JobManager>, request: UpdateWorkerStatusRequest| async move {
                manager
                    .handle_update_worker_status(request)
                    .await
                    .map(|()| done("Worker status updated."))
            },
        );
    let update_worker_status_endpoint = compose_common_wrappers(
        update_worker_status_routing,
        update_worker_status_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "update_worker_status",
    );

    //-------------------------------------------------------
    // abort a job
    let set_abort_routing = warp::path!("job" / "set_abort");
    let set_abort_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(|manager: Arc<JobManager>, request: JobNameRequest| async move {
            manager
                .handle_set_abort(request)
                .await
                .map(|()| done("Job aborted."))
        });
    let set_abort_endpoint = compose_common_wrappers(
        set_abort_routing,
        set_abort_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "set_abort",
    );

    //-------------------------------------------------------
    // terminate training
    let terminate_training_routing = warp::path!("job" / "terminate_training");
    let terminate_training_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(|manager: Arc<JobManager>, request: JobNameRequest| async move {
            manager
                .handle_terminate_training(request)
                .await
                .map(|()| done("Training terminated."))
        });
    let terminate_training_endpoint = compose_common_wrappers(
        terminate_training_routing,
        terminate_training_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "terminate_training",
    );

    //-------------------------------------------------------
    // delete a job
    let delete_routing = warp::path!("job" / "delete");
    let delete_responding = warp::post()
        .and(with_cloned_value(Arc::clone(&manager)))
        .and(json_body())
        .and(warp::body::json())
        .then(|manager: Arc<JobManager>, request: JobNameRequest| async move {
            manager
                .handle_delete(request)
                .await
                .map(|()| done("Job deleted."))
        });
    let delete_endpoint = compose_common_wrappers(
        delete_routing,
        delete_responding,
        cors("POST"),
        response_time_histogram.clone(),
        "delete",
    );

    //-------------------------------------------------------
    // list jobs
    let list_routing = warp::path!("job" / "list");
    let list_responding = warp::get()
        .and(with_cloned_value(Arc::clone(&manager)))
        .then(|manager: Arc<JobManager>| async move {
            let jobs = manager.handle_list().await;
            Ok::<_, LogiconError>(reply(&ApiResponse::success("Registered jobs.", Some(jobs))))
        });
    let list_endpoint = compose_common_wrappers(
        list_routing,
        list_responding,
        cors("GET"),
        response_time_histogram,
        "list",
    );

    Ok(root_endpoint
        .or(create_endpoint)
        .or(start_endpoint)
        .or(get_config_endpoint)
        .or(get_participants_endpoint)
        .or(get_job_status_endpoint)
        .or(get_exec_params_endpoint)
        .or(append_client_params_endpoint)
        .or(append_worker_params_endpoint)
        .or(update_client_status_endpoint)
        .or(update_worker_status_endpoint)
        .or(set_abort_endpoint)
        .or(terminate_training_endpoint)
        .or(delete_endpoint)
        .or(list_endpoint)
        .recover(handle_rejection)
        .boxed())
}

//////////////////////////////////////////////////
// options:

#[derive(Debug, Parser)]
#[clap(
    name = "logicon",
    about = "Job orchestration for hierarchical federated learning",
    rename_all = "kebab-case",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Options
{
    /// Path to the YAML configuration file.
    #[clap(long, env = "LOGICON_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Overrides the listen address of the configuration file.
    #[clap(long, env = "LOGICON_LISTEN_ADDRESS")]
    listen_address: Option<SocketAddr>,
}

//////////////////////////////////////////////////
// config:

/// Where model parameters are kept, selected by `kind`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamStoreConfig
{
    /// In the memory of this process.
    #[default]
    InMemory,

    /// In the key-value store service at `url`.
    Http
    {
        url: Url
    },
}

fn default_listen_address() -> SocketAddr
{
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_max_body_bytes() -> u64
{
    16 * 1024 * 1024
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config
{
    /// Address on which this server should listen for connections and serve its
    /// API endpoints.
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    #[serde(default)]
    pub logging_config: TraceConfiguration,

    #[serde(default)]
    pub param_store: ParamStoreConfig,

    /// Largest accepted request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for Config
{
    fn default() -> Self
    {
        Config {
            listen_address: default_listen_address(),
            logging_config: TraceConfiguration::default(),
            param_store: ParamStoreConfig::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Config
{
    /// Read the config file named in `options`, if any, and apply overrides.
    fn load(options: &Options) -> Result<Self>
    {
        let mut config = match &options.config_file
        {
            Some(path) =>
            {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("failed to open config file {}", path.display()))?;
                serde_yaml::from_reader(file)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Some(listen_address) = options.listen_address
        {
            config.listen_address = listen_address;
        }
        Ok(config)
    }
}

//////////////////////////////////////////////////////
// helpers:

/// The media type for problem details formatted as a JSON document, per RFC 7807.
static PROBLEM_DETAILS_JSON_MEDIA_TYPE: &str = "application/problem+json";

/// The number of seconds we send in the Access-Control-Max-Age header. This determines for how
/// long clients will cache the results of CORS preflight requests. Of popular browsers, Mozilla
/// Firefox has the highest Max-Age cap, at 24 hours, so we use that.
const CORS_PREFLIGHT_CACHE_AGE: u32 = 24 * 60 * 60;

/// Injects a clone of the provided value into the warp filter, making it
/// available to the filter's map() or and_then() handler.
fn with_cloned_value<T>(value: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone
where
    T: Clone + Sync + Send,
{
    warp::any().map(move || value.clone())
}

/// Convenience function to perform common composition of Warp filters for a single endpoint. A
/// combined filter is returned, with a CORS handler, instrumented to measure both request
/// processing time and successes or failures for metrics, and with per-route named tracing spans.
///
/// `route_filter` should be a filter that determines whether the incoming request matches a
/// given route or not. It should inspect the ambient request, and either extract the empty tuple
/// or reject.
///
/// `response_filter` should be a filter that performs all response handling for this route, after
/// the above `route_filter` has already determined the request is applicable to this route. It
/// should only reject in response to malformed requests, not requests that may yet be served by a
/// different route. Its errors are transformed into problem details responses.
///
/// `name` is a unique name for this route. This will be used as a metrics label, and will be added
/// to the tracing span's values as its message.
fn compose_common_wrappers<F1, F2, T>(
    route_filter: F1,
    response_filter: F2,
    cors: Cors,
    response_time_histogram: Histogram<f64>,
    name: &'static str,
) -> BoxedFilter<(impl Reply,)>
where
    F1: Filter<Extract = (), Error = Rejection> + Send + Sync + 'static,
    F2: Filter<Extract = (Result<T, LogiconError>,), Error = Rejection>
        + Clone
        + Send
        + Sync
        + 'static,
    T: Reply + 'static,
{
    route_filter
        .and(
            response_filter
                .with(warp::wrap_fn(error_handler(response_time_histogram, name)))
                .with(cors)
                .with(trace::named(name)),
        )
        .boxed()
}

/// Produces a closure that will transform errors into a problem details JSON object and record
/// the handling time, labelled by endpoint and error kind. The returned closure is meant to be
/// used in a warp `with` filter.
fn error_handler<F, T>(
    response_time_histogram: Histogram<f64>,
    name: &'static str,
) -> impl Fn(F) -> BoxedFilter<(Response,)>
where
    F: Filter<Extract = (Result<T, LogiconError>,), Error = Rejection>
        + Clone
        + Send
        + Sync
        + 'static,
    T: Reply,
{
    move |filter| {
        let response_time_histogram = response_time_histogram.clone();
        warp::any()
            .map(Instant::now)
            .and(filter)
            .map(move |start: Instant, result: Result<T, LogiconError>| {
                let error_code = if let Err(error) = &result
                {
                    warn!(?error, endpoint = name, "Error handling endpoint");
                    error.kind()
                }
                else
                {
                    ""
                };

                response_time_histogram.record(
                    &Context::current(),
                    start.elapsed().as_secs_f64(),
                    &[
                        KeyValue::new("endpoint", name),
                        KeyValue::new("error_code", error_code),
                    ],
                );

                match result
                {
                    Ok(reply) => reply.into_response(),
                    Err(error) => build_problem_details_response(&error),
                }
            })
            .boxed()
    }
}

/// Construct an error response carrying the error's message and status code.
fn build_problem_details_response(error: &LogiconError) -> Response
{
    warp::reply::with_status(
        warp::reply::with_header(
            warp::reply::json(&ApiResponse::<()>::failure(error.to_string())),
            http::header::CONTENT_TYPE,
            PROBLEM_DETAILS_JSON_MEDIA_TYPE,
        ),
        error.status_code(),
    )
    .into_response()
}

/// Turn requests that matched no route, or whose body or query could not be
/// decoded, into JSON responses.
async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible>
{
    let (status, message) = if rejection.is_not_found()
    {
        (StatusCode::NOT_FOUND, "Not found.".to_owned())
    }
    else if let Some(error) = rejection.find::<warp::filters::body::BodyDeserializeError>()
    {
        (StatusCode::BAD_REQUEST, error.to_string())
    }
    else if let Some(error) = rejection.find::<warp::reject::InvalidQuery>()
    {
        (StatusCode::BAD_REQUEST, error.to_string())
    }
    else if rejection.find::<warp::reject::PayloadTooLarge>().is_some()
    {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body is too large.".to_owned(),
        )
    }
    else if rejection.find::<warp::reject::LengthRequired>().is_some()
    {
        (
            StatusCode::LENGTH_REQUIRED,
            "Content-Length header is required.".to_owned(),
        )
    }
    else if rejection.find::<warp::reject::UnsupportedMediaType>().is_some()
    {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Request body must be JSON.".to_owned(),
        )
    }
    else if rejection.find::<warp::reject::MethodNotAllowed>().is_some()
    {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed.".to_owned(),
        )
    }
    else
    {
        warn!(?rejection, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error.".to_owned(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ApiResponse::<()>::failure(message)),
        status,
    )
    .into_response())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn config_file_sections_parse()
    {
        let yaml = r#"
listen_address: "127.0.0.1:7000"
logging_config:
  force_json_output: true
param_store:
  kind: http
  url: "http://kvstore:6666/"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:7000".parse().unwrap());
        assert!(config.logging_config.force_json_output);
        assert_eq!(
            config.param_store,
            ParamStoreConfig::Http {
                url: Url::parse("http://kvstore:6666/").unwrap()
            }
        );
        assert_eq!(config.max_body_bytes, default_max_body_bytes());

        let config: Config = serde_yaml::from_str("param_store:\n  kind: in_memory\n").unwrap();
        assert_eq!(config.param_store, ParamStoreConfig::InMemory);
        assert_eq!(config.listen_address, default_listen_address());
    }

    #[test]
    fn listen_address_can_be_overridden()
    {
        let options = Options {
            config_file: None,
            listen_address: Some("127.0.0.1:9999".parse().unwrap()),
        };
        let config = Config::load(&options).unwrap();
        assert_eq!(config.listen_address, options.listen_address.unwrap());
    }
}
