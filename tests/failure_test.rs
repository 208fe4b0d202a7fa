mod common;

use common::{bind_response, entry, MockServer, RIEMANN_DN, RIEMANN_PASSWORD};
use ldap_session::ldap_protocol::{
    ExtendedResponse, LdapResult, ProtocolOp, NOTICE_OF_DISCONNECTION_OID, START_TLS_OID,
};
use ldap_session::{
    Connection, ConnectionOptions, ConnectionState, LdapError, ResultCode, SearchOptions,
    SearchScope, TlsMode,
};
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_connect_refused_leaves_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let conn = Connection::new(ConnectionOptions::default());
    let err = conn
        .connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, LdapError::ConnectionRefused { .. }), "{:?}", err);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_twice_is_invalid() {
    let (server, _seen) = common::spawn_directory().await;
    let conn = common::connect(server.port).await;

    match conn.connect("127.0.0.1", server.port, Duration::from_secs(2)).await {
        Err(LdapError::InvalidState { actual, .. }) => {
            assert_eq!(actual, ConnectionState::Connected)
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert!(conn.is_connected());

    conn.disconnect().await;
    server.join().await;
}

#[tokio::test]
async fn test_garbage_frame_is_fatal() {
    let server = MockServer::spawn(|mut conn| async move {
        conn.recv().await.unwrap();
        conn.send_raw(&[0x04, 0x03, 0x61, 0x62, 0x63]).await;
        while conn.recv().await.is_some() {}
    })
    .await;
    let conn = common::connect(server.port).await;

    let mut stream = conn
        .search("dc=example,dc=com", SearchScope::Subtree, "(cn=*)", &[], &SearchOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        stream.has_more().await,
        Err(LdapError::ConnectionLost { .. })
    ));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.metrics().snapshot().protocol_errors, 1);

    let err = conn.bind(RIEMANN_DN, RIEMANN_PASSWORD).await.unwrap_err();
    assert!(matches!(err, LdapError::InvalidState { .. }), "{:?}", err);

    conn.disconnect().await;
    server.join().await;
}

#[tokio::test]
async fn test_server_close_mid_stream() {
    let server = MockServer::spawn(|mut conn| async move {
        let id = conn.recv().await.unwrap().message_id;
        conn.send(id, entry("cn=only", &[("cn", &["only"])])).await;
    })
    .await;
    let conn = common::connect(server.port).await;

    let mut stream = conn
        .search("dc=example,dc=com", SearchScope::Subtree, "(cn=*)", &[], &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(stream.next_entry().await.unwrap().dn, "cn=only");
    assert!(matches!(
        stream.next_entry().await,
        Err(LdapError::ConnectionLost { .. })
    ));
    assert_eq!(stream.count(), 1);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.metrics().snapshot().connections_lost, 1);
    server.join().await;
}

#[tokio::test]
async fn test_disconnect_mid_stream_unblocks_reader() {
    let server = MockServer::spawn(|mut conn| async move {
        let id = conn.recv().await.unwrap().message_id;
        conn.send(id, entry("cn=first", &[("cn", &["first"])])).await;
        while conn.recv().await.is_some() {}
    })
    .await;
    let conn = common::connect(server.port).await;

    let mut stream = conn
        .search("dc=example,dc=com", SearchScope::Subtree, "(cn=*)", &[], &SearchOptions::default())
        .await
        .unwrap();
    assert!(stream.has_more().await.unwrap());
    stream.next_entry().await.unwrap();

    conn.disconnect().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    let next = tokio::time::timeout(Duration::from_secs(2), stream.has_more())
        .await
        .expect("has_more blocked after disconnect");
    assert!(!matches!(next, Ok(true)));
    server.join().await;
}

#[tokio::test]
async fn test_notice_of_disconnection() {
    let server = MockServer::spawn(|mut conn| async move {
        conn.recv().await.unwrap();
        conn.send(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::new(ResultCode::Unavailable, "server shutting down"),
                response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                response_value: None,
            }),
        )
        .await;
        while conn.recv().await.is_some() {}
    })
    .await;
    let conn = common::connect(server.port).await;

    let err = conn.bind(RIEMANN_DN, RIEMANN_PASSWORD).await.unwrap_err();
    assert!(matches!(err, LdapError::ConnectionLost { .. }), "{:?}", err);
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    conn.disconnect().await;
    server.join().await;
}

#[tokio::test]
async fn test_bind_timeout() {
    let server = MockServer::spawn(|mut conn| async move {
        while conn.recv().await.is_some() {}
    })
    .await;
    let options = ConnectionOptions {
        operation_timeout: Some(Duration::from_millis(100)),
        ..ConnectionOptions::default()
    };
    let conn = common::connect_with(server.port, options).await;

    let err = conn.bind(RIEMANN_DN, RIEMANN_PASSWORD).await.unwrap_err();
    assert!(matches!(err, LdapError::Timeout(_)), "{:?}", err);
    assert!(err.is_fatal());

    conn.disconnect().await;
    server.join().await;
}

#[tokio::test]
async fn test_reconnect_after_loss() {
    let first = MockServer::spawn(|_conn| async move {}).await;
    let conn = common::connect(first.port).await;
    first.join().await;

    let mut waited = Duration::ZERO;
    while conn.state() != ConnectionState::Disconnected && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let (second, _seen) = common::spawn_directory().await;
    conn.connect("127.0.0.1", second.port, Duration::from_secs(2))
        .await
        .unwrap();
    conn.bind(RIEMANN_DN, RIEMANN_PASSWORD).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Bound);

    conn.disconnect().await;
    second.join().await;
}

#[tokio::test]
async fn test_start_tls_refused_keeps_plain_connection() {
    let server = MockServer::spawn(|mut conn| async move {
        let request = conn.recv().await.unwrap();
        match &request.protocol_op {
            ProtocolOp::ExtendedRequest(ext) => assert_eq!(ext.request_name, START_TLS_OID),
            other => panic!("expected ExtendedRequest, got {:?}", other),
        }
        conn.send(
            request.message_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::new(ResultCode::UnwillingToPerform, "no TLS here"),
                response_name: None,
                response_value: None,
            }),
        )
        .await;
        let bind = conn.recv().await.unwrap();
        conn.send(bind.message_id, bind_response(ResultCode::Success))
            .await;
        while conn.recv().await.is_some() {}
    })
    .await;
    let conn = common::connect(server.port).await;

    match conn.start_tls().await {
        Err(LdapError::Operation { code, .. }) => {
            assert_eq!(code, ResultCode::UnwillingToPerform)
        }
        other => panic!("expected Operation error, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.bind(RIEMANN_DN, RIEMANN_PASSWORD).await.unwrap();

    conn.disconnect().await;
    server.join().await;
}

#[tokio::test]
async fn test_start_tls_mode_refused_fails_connect() {
    let server = MockServer::spawn(|mut conn| async move {
        let request = conn.recv().await.unwrap();
        conn.send(
            request.message_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::new(ResultCode::ProtocolError, "unsupported"),
                response_name: None,
                response_value: None,
            }),
        )
        .await;
        while conn.recv().await.is_some() {}
    })
    .await;
    let options = ConnectionOptions {
        tls_mode: TlsMode::StartTls,
        ..ConnectionOptions::default()
    };
    let conn = Connection::new(options);

    let err = conn
        .connect("127.0.0.1", server.port, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, LdapError::Operation { .. }), "{:?}", err);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    server.join().await;
}

#[tokio::test]
async fn test_start_tls_with_outstanding_search() {
    let server = MockServer::spawn(|mut conn| async move {
        while conn.recv().await.is_some() {}
    })
    .await;
    let conn = common::connect(server.port).await;

    let _stream = conn
        .search("dc=example,dc=com", SearchScope::Subtree, "(cn=*)", &[], &SearchOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        conn.start_tls().await,
        Err(LdapError::OutstandingRequests(1))
    ));
    assert!(conn.is_connected());

    conn.disconnect().await;
    server.join().await;
}
