//! Installation into a host, then real HTTP against the mock server.
//!
//! # Design
//! Starts the mock server on a random port and binds ureq-backed primitives
//! into a [`Host`]. Page-side calls go through the host's slots exactly as
//! page code would, so these tests cover installation, rewrapping on
//! reassignment and the wire behaviour of both primitives together.

mod common;

use std::sync::Arc;

use common::{count, init_tracing, record, spawn_server, NativeXhrFactory, Scripted, UreqTransport};
use futures::FutureExt;
use netfilter_core::interposer::is_marked;
use netfilter_core::{
    Activation, AsyncTransport, ExecutionContext, Host, InstallMode, Installation,
    InterceptConfig, InterceptionContext, Method, Request, RequestAction, Response, ResponseType,
    StatefulTransportFactory, XhrBody, XhrEventKind,
};

fn context(install_mode: InstallMode) -> Arc<InterceptionContext> {
    init_tracing();
    InterceptionContext::new(InterceptConfig {
        install_mode,
        ..InterceptConfig::default()
    })
}

fn scripted_host(context: ExecutionContext, transport: &Arc<Scripted>) -> Host {
    Host::with_transports(
        context,
        transport.clone(),
        NativeXhrFactory::new(transport.clone()),
    )
}

fn tag_requests(ctx: &Arc<InterceptionContext>) -> netfilter_core::Registration {
    ctx.register_request_filter(|request: Request| async move {
        anyhow::Ok(RequestAction::Replace(request.with_header("x-intercepted", "1")))
    })
}

// --- installation ---

#[tokio::test]
async fn non_page_contexts_are_left_alone() {
    let ctx = context(InstallMode::AutoRewrap);
    let _tag = tag_requests(&ctx);
    let transport = Scripted::ok(200, "fine");
    let host = scripted_host(ExecutionContext::ContentScript, &transport);

    assert_eq!(ctx.install(&host), Activation::Skipped);
    assert_eq!(host.fetch_slot().installation(), Installation::Uninstalled);

    host.fetch(Request::get("https://a.test/")).await.unwrap();
    assert!(!transport.last().unwrap().headers().contains("x-intercepted"));
}

#[tokio::test]
async fn installing_twice_filters_once() {
    let ctx = context(InstallMode::AutoRewrap);
    let _tag = ctx.register_request_filter(|request: Request| async move {
        let hops = request.headers().get_all("x-hop").len();
        anyhow::Ok(RequestAction::Replace(
            request.with_header("x-hop", (hops + 1).to_string()),
        ))
    });
    let transport = Scripted::ok(200, "fine");
    let host = scripted_host(ExecutionContext::PageInjection, &transport);

    assert_eq!(ctx.install(&host), Activation::Installed);
    assert_eq!(ctx.install(&host), Activation::Installed);

    host.fetch(Request::get("https://a.test/")).await.unwrap();
    assert_eq!(transport.last().unwrap().headers().get("x-hop").as_deref(), Some("1"));

    let mut xhr = host.create_xhr().unwrap();
    xhr.open(Method::Get, "https://a.test/", true).unwrap();
    xhr.send(None).await.unwrap();
    assert_eq!(transport.last().unwrap().headers().get("x-hop").as_deref(), Some("1"));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn reassigned_primitive_is_rewrapped() {
    let ctx = context(InstallMode::AutoRewrap);
    let _tag = tag_requests(&ctx);
    let first = Scripted::ok(200, "first");
    let host = scripted_host(ExecutionContext::PageInjection, &first);
    ctx.install(&host);

    let second = Scripted::ok(200, "second");
    host.bind_fetch(second.clone());

    let marker = ctx.async_interposer().marker();
    assert!(is_marked(&*host.fetch_slot().get().unwrap(), marker));
    assert_eq!(host.fetch_slot().installation(), Installation::AutoRewrap);

    let mut response = host.fetch(Request::get("https://a.test/")).await.unwrap();
    assert_eq!(response.text().unwrap(), "second");
    assert!(second.last().unwrap().headers().contains("x-intercepted"));
    assert_eq!(first.calls(), 0);
}

#[tokio::test]
async fn fixed_install_does_not_follow_reassignment() {
    let ctx = context(InstallMode::Fixed);
    let _tag = tag_requests(&ctx);
    let first = Scripted::ok(200, "first");
    let host = scripted_host(ExecutionContext::PageInjection, &first);
    ctx.install(&host);
    assert_eq!(host.fetch_slot().installation(), Installation::Fixed);

    let second = Scripted::ok(200, "second");
    host.bind_fetch(second.clone());
    host.fetch(Request::get("https://a.test/")).await.unwrap();
    assert!(!second.last().unwrap().headers().contains("x-intercepted"));
}

#[tokio::test]
async fn deferred_install_waits_for_both_primitives() {
    let ctx = context(InstallMode::AutoRewrap);
    let _tag = tag_requests(&ctx);
    let host = Host::new(ExecutionContext::PageInjection);
    let transport = Scripted::ok(200, "late");

    let mut pending = Box::pin(ctx.install_deferred(&host));
    assert!((&mut pending).now_or_never().is_none());

    host.bind_fetch(transport.clone());
    assert!((&mut pending).now_or_never().is_none());

    let factory: Arc<dyn StatefulTransportFactory> = NativeXhrFactory::new(transport.clone());
    host.bind_xhr(factory);
    assert_eq!(pending.await, Activation::Installed);

    host.fetch(Request::get("https://a.test/")).await.unwrap();
    assert!(transport.last().unwrap().headers().contains("x-intercepted"));
    assert_eq!(host.xhr_slot().installation(), Installation::AutoRewrap);
}

#[tokio::test]
async fn global_context_registration() {
    let registration = netfilter_core::register_request_filter(|_request: Request| async move {
        anyhow::Ok(RequestAction::Continue)
    });
    assert!(netfilter_core::global().request_filter_count() >= 1);
    assert!(registration.unregister());
    assert!(!registration.is_active());
}

// --- over the wire ---

#[tokio::test]
async fn real_network_through_both_primitives() {
    let (base, hits) = spawn_server();
    let ctx = context(InstallMode::AutoRewrap);
    let _tag = tag_requests(&ctx);
    let _stub = ctx.register_request_filter(|request: Request| async move {
        if request.url().ends_with("/stub") {
            anyhow::Ok(RequestAction::Respond(
                Response::new(204).with_header("x-test", "1"),
            ))
        } else {
            anyhow::Ok(RequestAction::Continue)
        }
    });

    let transport: Arc<dyn AsyncTransport> = Arc::new(UreqTransport);
    let host = Host::with_transports(
        ExecutionContext::PageInjection,
        Arc::clone(&transport),
        NativeXhrFactory::new(transport),
    );
    assert_eq!(ctx.install(&host), Activation::Installed);

    // async primitive: the filter's header reaches the server
    let mut response = host
        .fetch(Request::builder(format!("{base}/echo")).method(Method::Post).body("ping").build())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echo: mock_server::Echo = response.json().unwrap();
    assert_eq!(echo.method, "POST");
    assert_eq!(echo.body, "ping");
    assert_eq!(echo.headers.get("x-intercepted").map(String::as_str), Some("1"));

    // stateful primitive, JSON response
    let mut xhr = host.create_xhr().unwrap();
    let events = record(xhr.as_mut());
    xhr.open(Method::Get, &format!("{base}/json"), true).unwrap();
    xhr.set_response_type(ResponseType::Json).unwrap();
    xhr.send(None).await.unwrap();
    assert_eq!(xhr.status(), 200);
    assert_eq!(
        xhr.get_response_header("content-type").as_deref(),
        Some("application/json")
    );
    match xhr.response() {
        Some(XhrBody::Json(value)) => assert_eq!(value["ok"], true),
        other => panic!("unexpected body {other:?}"),
    }
    assert_eq!(count(&events.lock(), XhrEventKind::Load), 1);

    // binary body keeps its bytes
    xhr.open(Method::Get, &format!("{base}/bytes/16"), true).unwrap();
    xhr.set_response_type(ResponseType::ArrayBuffer).unwrap();
    xhr.send(None).await.unwrap();
    match xhr.response() {
        Some(XhrBody::ArrayBuffer(data)) => assert_eq!(data.len(), 16),
        other => panic!("unexpected body {other:?}"),
    }

    // server error statuses are responses, not failures
    xhr.open(Method::Get, &format!("{base}/status/503"), true).unwrap();
    xhr.set_response_type(ResponseType::Text).unwrap();
    xhr.send(None).await.unwrap();
    assert_eq!(xhr.status(), 503);
    assert_eq!(xhr.get_response_header("x-mock-status").as_deref(), Some("503"));

    // short-circuit never reaches the server
    let served = hits.load(std::sync::atomic::Ordering::SeqCst);
    xhr.open(Method::Get, &format!("{base}/stub"), true).unwrap();
    xhr.send(None).await.unwrap();
    assert_eq!(xhr.status(), 204);
    assert_eq!(xhr.get_response_header("x-test").as_deref(), Some("1"));
    let response = host.fetch(Request::get(format!("{base}/stub"))).await.unwrap();
    assert_eq!(response.status(), 204);
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), served);
}

#[tokio::test]
async fn unreachable_server_is_reported_as_network_error() {
    let ctx = context(InstallMode::AutoRewrap);
    // Bind then drop a listener so the port is closed.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let transport: Arc<dyn AsyncTransport> = Arc::new(UreqTransport);
    let host = Host::with_transports(
        ExecutionContext::PageInjection,
        Arc::clone(&transport),
        NativeXhrFactory::new(transport),
    );
    ctx.install(&host);

    let err = host
        .fetch(Request::get(format!("http://{addr}/json")))
        .await
        .unwrap_err();
    assert!(err.is_network());

    let mut xhr = host.create_xhr().unwrap();
    let events = record(xhr.as_mut());
    xhr.open(Method::Get, &format!("http://{addr}/json"), true).unwrap();
    xhr.send(None).await.unwrap();
    assert_eq!(xhr.status(), 0);
    assert_eq!(count(&events.lock(), XhrEventKind::Error), 1);
}
