
use std::time::Duration;

use eva_local_proxy::{
    reason, service_unavailable, ProxyConfig, ProxyError, ProxyEvent, SessionOutcome,
};
use harness::{
    count_closed, dead_port, read_exact_timeout, read_to_close, roundtrip, ProxyHandle,
    TcpEchoBackend, UnresponsiveBackend,
};
use tokio::net::TcpListener;
use tokio::time::timeout;

#[tokio::test]
async fn stop_terminates_every_session() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut proxy = ProxyHandle::spawn(ProxyConfig::default(), backend.addr.port()).await;
    proxy.server.set_backend_available(true).await.unwrap();

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let mut client = proxy.connect().await;
        assert_eq!(roundtrip(&mut client, &[i]).await, vec![i]);
        clients.push(client);
    }

    assert_eq!(proxy.server.stop().await.unwrap(), 3);

    let events = proxy.drain();
    assert_eq!(count_closed(&events), 3);

    for client in &mut clients {
        assert_eq!(
            read_to_close(client).await,
            service_unavailable(reason::PROXY_STOPPED)
        );
    }

    let status = proxy.server.status().await.unwrap();
    assert_eq!(status.active_sessions, 0);
    assert_eq!(status.pending_sessions, 0);
    assert_eq!(status.listen_addr, None);
}

#[tokio::test]
async fn shutdown_sessions_fails_waiting_clients_with_reason() {
    let mut proxy = ProxyHandle::spawn(ProxyConfig::default(), dead_port().await).await;

    let mut a = proxy.connect().await;
    let mut b = proxy.connect().await;
    proxy.wait_for_opened(2).await;

    assert_eq!(proxy.server.shutdown_sessions("maintenance").await.unwrap(), 2);
    assert_eq!(read_to_close(&mut a).await, service_unavailable("maintenance"));
    assert_eq!(read_to_close(&mut b).await, service_unavailable("maintenance"));

    assert_eq!(proxy.server.status().await.unwrap().pending_sessions, 0);
    assert!(proxy.server.is_listening().await);
}

#[tokio::test]
async fn refused_backend_yields_backend_unavailable() {
    let mut proxy = ProxyHandle::spawn(ProxyConfig::default(), dead_port().await).await;
    proxy.server.set_backend_available(true).await.unwrap();

    let mut client = proxy.connect().await;
    assert_eq!(
        read_to_close(&mut client).await,
        service_unavailable(reason::BACKEND_UNAVAILABLE)
    );
    assert_eq!(
        proxy.wait_for_closed().await,
        SessionOutcome::Failed {
            reason: reason::BACKEND_UNAVAILABLE.to_string()
        }
    );
}

#[tokio::test]
async fn connect_timeout_yields_backend_timeout() {
    let backend = UnresponsiveBackend::spawn().await.unwrap();
    let config = ProxyConfig::default().with_connect_timeout(Duration::from_millis(200));
    let mut proxy = ProxyHandle::spawn(config, backend.port).await;
    proxy.server.set_backend_available(true).await.unwrap();

    let mut client = proxy.connect().await;
    assert_eq!(
        read_to_close(&mut client).await,
        service_unavailable(reason::BACKEND_TIMEOUT)
    );
    assert_eq!(
        proxy.wait_for_closed().await,
        SessionOutcome::Failed {
            reason: reason::BACKEND_TIMEOUT.to_string()
        }
    );
}

#[tokio::test]
async fn stop_completes_while_client_is_not_reading() {
    let backend = TcpEchoBackend::spawn_flooding().await.unwrap();
    let config = ProxyConfig::default().with_flush_timeout(Duration::from_millis(200));
    let proxy = ProxyHandle::spawn(config, backend.addr.port()).await;
    proxy.server.set_backend_available(true).await.unwrap();

    let mut client = proxy.connect().await;
    read_exact_timeout(&mut client, 16).await;
    // Let socket buffers fill so the relay is stuck writing to the client.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stopped = timeout(Duration::from_secs(5), proxy.server.stop())
        .await
        .expect("stop must not wait on a stalled client");
    assert_eq!(stopped.unwrap(), 1);

    let status = timeout(Duration::from_secs(1), proxy.server.status())
        .await
        .expect("server must stay responsive after stop")
        .unwrap();
    assert_eq!(status.active_sessions, 0);
    assert_eq!(status.listen_addr, None);
    drop(client);
}

#[tokio::test]
async fn backend_hangup_yields_backend_disconnected() {
    let backend = TcpEchoBackend::spawn_closing().await.unwrap();
    let mut proxy = ProxyHandle::spawn(ProxyConfig::default(), backend.addr.port()).await;
    proxy.server.set_backend_available(true).await.unwrap();

    let mut client = proxy.connect().await;
    tokio::io::AsyncWriteExt::write_all(&mut client, b"request")
        .await
        .unwrap();

    assert_eq!(
        read_to_close(&mut client).await,
        service_unavailable(reason::BACKEND_DISCONNECTED)
    );
    assert!(matches!(
        proxy.wait_for_closed().await,
        SessionOutcome::Failed { .. }
    ));
}

#[tokio::test]
async fn client_close_is_silent() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut proxy = ProxyHandle::spawn(ProxyConfig::default(), backend.addr.port()).await;
    proxy.server.set_backend_available(true).await.unwrap();

    let mut client = proxy.connect().await;
    assert_eq!(roundtrip(&mut client, b"bye").await, b"bye");
    drop(client);

    assert_eq!(proxy.wait_for_closed().await, SessionOutcome::Closed);
    assert_eq!(proxy.server.status().await.unwrap().active_sessions, 0);
}

#[tokio::test]
async fn start_on_same_endpoint_is_idempotent() {
    let proxy = ProxyHandle::spawn(ProxyConfig::default(), dead_port().await).await;

    let again = proxy.server.start("127.0.0.1", 0).await.unwrap();
    assert_eq!(again, proxy.listen_addr);

    let by_port = proxy
        .server
        .start("127.0.0.1", proxy.listen_addr.port())
        .await
        .unwrap();
    assert_eq!(by_port, proxy.listen_addr);
    assert_eq!(proxy.server.listen_addr().await, Some(proxy.listen_addr));
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut proxy = ProxyHandle::spawn(ProxyConfig::default(), dead_port().await).await;
    proxy.server.stop().await.unwrap();

    let err = proxy.server.start("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, ProxyError::Bind { .. }));
    proxy
        .wait_for(|e| matches!(e, ProxyEvent::ProxyError(_)))
        .await;
    assert!(!proxy.server.is_listening().await);
}

#[tokio::test]
async fn dropped_server_emits_nothing_further() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut proxy = ProxyHandle::spawn(ProxyConfig::default(), backend.addr.port()).await;
    let mut client = proxy.connect().await;
    proxy.wait_for_opened(1).await;
    proxy.drain();

    let ProxyHandle {
        server, mut events, ..
    } = proxy;
    server.shutdown().await;

    // Muted before sessions are torn down: no SessionClosed, channel closed.
    assert!(events.recv().await.is_none());
    assert_eq!(
        read_to_close(&mut client).await,
        service_unavailable(reason::PROXY_STOPPED)
    );
}
