//! Invocation and retry engine
//!
//! One call goes: fixed connection, or collocated adapter, or
//! resolve endpoints -> get a connection -> send -> await the reply. A
//! failed attempt is retried when [`is_retriable`] says the request can
//! be sent again without risking a second execution, up to
//! `Floe.RetryIntervals` times.

use crate::adapter::ObjectAdapter;
use crate::communicator::Instance;
use crate::config::EndpointSelection;
use crate::connection::{ConnectError, Connection, SendError};
use crate::endpoint::Endpoint;
use crate::error::{reply_to_result, Result, RpcError, TimeoutKind};
use crate::proxy::{InvocationOptions, ObjectPrx};
use crate::reference::{InvocationMode, Reference};
use bytes::Bytes;
use floe_proto::{Encapsulation, OperationMode, Request};
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A failed attempt
#[derive(Debug)]
struct Failure {
    error: RpcError,
    /// The request may have reached the peer
    sent: bool,
    /// Endpoints that could not be connected to
    failed: Vec<Endpoint>,
}

impl Failure {
    fn not_sent(error: RpcError) -> Self {
        Self {
            error,
            sent: false,
            failed: Vec::new(),
        }
    }
}

impl From<SendError> for Failure {
    fn from(e: SendError) -> Self {
        Self {
            error: e.error,
            sent: e.sent,
            failed: Vec::new(),
        }
    }
}

/// Whether an attempt that failed with `error` may be repeated.
///
/// Connection establishment failures and a peer's graceful close never
/// reached a servant. A lost or aborted connection might have, so those
/// are repeated only when nothing was written or the operation is an
/// idempotent twoway call.
pub(crate) fn is_retriable(error: &RpcError, sent: bool, idempotent_twoway: bool) -> bool {
    match error {
        RpcError::ConnectFailed { .. }
        | RpcError::Timeout(TimeoutKind::Connect)
        | RpcError::ConnectionClosed => true,
        RpcError::ConnectionLost(_)
        | RpcError::ConnectionAborted(_)
        | RpcError::Timeout(TimeoutKind::Connection) => !sent || idempotent_twoway,
        _ => false,
    }
}

pub(crate) async fn invoke(
    proxy: &ObjectPrx,
    operation: &str,
    mode: OperationMode,
    params: Bytes,
    options: InvocationOptions,
) -> Result<Bytes> {
    let instance = proxy.instance();
    instance.check_alive()?;
    let reference = proxy.reference();

    let request = Request {
        request_id: 0,
        identity: reference.identity().clone(),
        facet: reference.facet().to_string(),
        operation: operation.to_string(),
        mode,
        context: options
            .context
            .unwrap_or_else(|| reference.context().clone()),
        params: Encapsulation::with_encoding(reference.encoding(), params),
    };

    if reference.mode() == InvocationMode::Batch {
        proxy.queue_batch_request(request);
        return Ok(Bytes::new());
    }

    let deadline = options
        .deadline
        .or_else(|| reference.invocation_timeout().map(|t| Instant::now() + t));
    let cancel = options.cancel.unwrap_or_default();

    tokio::select! {
        biased;
        result = run(instance, reference, request) => result,
        _ = cancel.cancelled() => {
            trace!(target: "floe::retry", "`{}` on `{}` cancelled", operation, reference.identity());
            Err(RpcError::Cancelled)
        }
        _ = deadline_reached(deadline) => Err(RpcError::Timeout(TimeoutKind::Invocation)),
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(instance: &Arc<Instance>, reference: &Reference, request: Request) -> Result<Bytes> {
    let twoway = reference.mode().is_twoway();
    if let Some(connection) = reference.fixed() {
        return send_on(connection, request, twoway)
            .await
            .map_err(|f| f.error);
    }
    if let Some(adapter) = collocated_adapter(instance, reference) {
        return collocated(instance, adapter, request, twoway).await;
    }

    let idempotent_twoway = twoway && request.mode.is_idempotent();
    with_retries(instance, reference, idempotent_twoway, |failed| {
        let request = request.clone();
        async move {
            let connection = connect(instance, reference, failed).await?;
            send_on(&connection, request, twoway).await
        }
    })
    .await
}

/// Run `attempt` until it succeeds or fails for good. Each attempt gets
/// the endpoints that failed in the one before.
async fn with_retries<T, F, Fut>(
    instance: &Arc<Instance>,
    reference: &Reference,
    idempotent_twoway: bool,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(Vec<Endpoint>) -> Fut,
    Fut: Future<Output = std::result::Result<T, Failure>>,
{
    let intervals = &instance.config().retry_intervals;
    let mut failed = Vec::new();
    let mut retries = 0;
    let mut relocated = false;
    loop {
        let failure = match attempt(std::mem::take(&mut failed)).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        let retriable = match &failure.error {
            RpcError::ObjectNotExist { .. } if reference.is_indirect() && !relocated => {
                relocated = true;
                true
            }
            error => is_retriable(error, failure.sent, idempotent_twoway),
        };
        if !retriable {
            return Err(failure.error);
        }
        if retries >= intervals.len() {
            debug!(
                target: "floe::retry",
                "giving up on `{}` after {} retries: {}",
                reference.identity(),
                retries,
                failure.error
            );
            return Err(failure.error);
        }

        let delay = intervals[retries];
        retries += 1;
        if reference.is_indirect() {
            instance.locator_info().invalidate(reference);
        }
        debug!(
            target: "floe::retry",
            "retrying `{}` ({}/{}) in {:?}: {}",
            reference.identity(),
            retries,
            intervals.len(),
            delay,
            failure.error
        );
        failed = failure.failed;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn send_on(
    connection: &Connection,
    request: Request,
    twoway: bool,
) -> std::result::Result<Bytes, Failure> {
    match connection.send_request(request, twoway).await? {
        Some(pending) => match pending.wait().await {
            Ok(body) => reply_to_result(body).map_err(|error| Failure {
                error,
                sent: true,
                failed: Vec::new(),
            }),
            Err(error) => Err(Failure {
                error,
                sent: true,
                failed: Vec::new(),
            }),
        },
        None => Ok(Bytes::new()),
    }
}

/// A connection to one of the reference's endpoints
async fn connect(
    instance: &Arc<Instance>,
    reference: &Reference,
    failed: Vec<Endpoint>,
) -> std::result::Result<Connection, Failure> {
    let endpoints = resolve_endpoints(instance, reference)
        .await
        .map_err(Failure::not_sent)?;
    let endpoints = order_endpoints(reference, endpoints, &failed).map_err(Failure::not_sent)?;
    instance
        .outgoing_connections()
        .get_connection(instance, &endpoints)
        .await
        .map_err(|ConnectError { error, failed }| Failure {
            error,
            sent: false,
            failed,
        })
}

async fn resolve_endpoints(instance: &Arc<Instance>, reference: &Reference) -> Result<Vec<Endpoint>> {
    if !reference.endpoints().is_empty() {
        return Ok(reference.endpoints().to_vec());
    }
    let Some(locator) = instance.default_locator() else {
        return Err(RpcError::NoEndpoint(format!(
            "no locator to resolve `{}`",
            describe(reference)
        )));
    };
    let endpoints = instance
        .locator_info()
        .resolve(locator.as_ref(), reference)
        .await?;
    Ok(reference.apply_overrides(endpoints))
}

fn describe(reference: &Reference) -> String {
    match reference.adapter_id() {
        Some(adapter_id) => format!("{} @ {}", reference.identity(), adapter_id),
        None => reference.identity().to_string(),
    }
}

/// Keep the endpoints usable for the reference's mode and security, in
/// selection order, with endpoints that just failed moved to the back.
fn order_endpoints(
    reference: &Reference,
    endpoints: Vec<Endpoint>,
    failed: &[Endpoint],
) -> Result<Vec<Endpoint>> {
    let datagram = reference.mode() == InvocationMode::Datagram;
    let total = endpoints.len();
    let mut usable: Vec<Endpoint> = endpoints
        .into_iter()
        .filter(|e| e.is_datagram() == datagram)
        .filter(|e| !reference.is_secure() || e.is_secure())
        .collect();

    if usable.is_empty() {
        if reference.mode().is_twoway() && total > 0 && !reference.is_secure() {
            return Err(RpcError::TwowayOverDatagram);
        }
        return Err(RpcError::NoEndpoint(format!(
            "no {}{} endpoint for `{}`",
            if reference.is_secure() { "secure " } else { "" },
            if datagram { "datagram" } else { "stream" },
            describe(reference)
        )));
    }

    if reference.endpoint_selection() == EndpointSelection::Random {
        usable.shuffle(&mut rand::rng());
    }
    let (fresh, stale): (Vec<_>, Vec<_>) = usable.into_iter().partition(|e| !failed.contains(e));
    Ok(fresh.into_iter().chain(stale).collect())
}

fn collocated_adapter(instance: &Arc<Instance>, reference: &Reference) -> Option<ObjectAdapter> {
    if !reference.collocation_optimized() || reference.mode() == InvocationMode::Datagram {
        return None;
    }
    instance.find_collocated(reference)
}

/// Dispatch in-process. The dispatch runs as its own task on the server
/// pool so that a caller giving up cannot interrupt a servant midway.
async fn collocated(
    instance: &Arc<Instance>,
    adapter: ObjectAdapter,
    mut request: Request,
    twoway: bool,
) -> Result<Bytes> {
    let permit = adapter.admit_dispatch().await?;
    // collocated twoway dispatches need a non-zero id to not look oneway
    request.request_id = if twoway { 1 } else { 0 };
    trace!(
        target: "floe::dispatch",
        "collocated `{}` on `{}`",
        request.operation,
        request.identity
    );
    let dispatch = instance.server_pool().spawn(async move {
        let body = adapter.dispatch(request, None).await;
        drop(permit);
        body
    });
    if !twoway {
        return Ok(Bytes::new());
    }
    match dispatch.await {
        Ok(body) => reply_to_result(body),
        Err(e) => Err(RpcError::Unknown(format!("collocated dispatch failed: {}", e))),
    }
}

pub(crate) async fn get_connection(proxy: &ObjectPrx) -> Result<Option<Connection>> {
    let instance = proxy.instance();
    instance.check_alive()?;
    let reference = proxy.reference();
    if let Some(connection) = reference.fixed() {
        return Ok(Some(connection.clone()));
    }
    if collocated_adapter(instance, reference).is_some() {
        return Ok(None);
    }
    with_retries(instance, reference, false, |failed| {
        connect(instance, reference, failed)
    })
    .await
    .map(Some)
}

pub(crate) async fn flush_batch(proxy: &ObjectPrx, requests: Vec<Request>) -> Result<()> {
    if requests.is_empty() {
        return Ok(());
    }
    let instance = proxy.instance();
    instance.check_alive()?;
    let reference = proxy.reference();

    if let Some(connection) = reference.fixed() {
        return connection.send_batch(requests).await.map_err(|e| e.error);
    }
    if let Some(adapter) = collocated_adapter(instance, reference) {
        instance.server_pool().spawn(async move {
            for request in requests {
                match adapter.admit_dispatch().await {
                    Ok(permit) => {
                        adapter.dispatch(request, None).await;
                        drop(permit);
                    }
                    Err(e) => {
                        debug!(target: "floe::dispatch", "dropping collocated batch: {}", e);
                        return;
                    }
                }
            }
        });
        return Ok(());
    }

    with_retries(instance, reference, false, |failed| {
        let requests = requests.clone();
        async move {
            let connection = connect(instance, reference, failed).await?;
            connection.send_batch(requests).await.map_err(Failure::from)
        }
    })
    .await
}
