//! Integration tests exercising the concrete transports through the
//! factory, the way the bus uses them.

use tokio_test::assert_ok;

use meridian_transport::{create_transport, TransportError};

#[tokio::test]
async fn tcp_delivers_frames_from_one_sender() {
    let mut server = create_transport("tcp://127.0.0.1:18701").unwrap();
    assert_ok!(server.bind().await);

    let mut client = create_transport("tcp://127.0.0.1:18701").unwrap();
    assert_ok!(client.connect().await);

    client.send(b"first").await.unwrap();
    client.send(b"second").await.unwrap();

    assert_eq!(server.recv().await.unwrap(), b"first");
    assert_eq!(server.recv().await.unwrap(), b"second");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn tcp_fans_in_multiple_senders() {
    let mut server = create_transport("tcp://127.0.0.1:18702").unwrap();
    server.bind().await.unwrap();

    let mut client_1 = create_transport("tcp://127.0.0.1:18702").unwrap();
    client_1.connect().await.unwrap();
    let mut client_2 = create_transport("tcp://127.0.0.1:18702").unwrap();
    client_2.connect().await.unwrap();

    client_1.send(b"from-1").await.unwrap();
    client_2.send(b"from-2").await.unwrap();

    let mut got = vec![
        server.recv().await.unwrap(),
        server.recv().await.unwrap(),
    ];
    got.sort();
    assert_eq!(got, vec![b"from-1".to_vec(), b"from-2".to_vec()]);

    client_1.close().await.unwrap();
    client_2.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn inproc_delivers_frames() {
    let mut server = create_transport("inproc://transport-test-a").unwrap();
    assert_ok!(server.bind().await);

    let mut client = create_transport("inproc://transport-test-a").unwrap();
    assert_ok!(client.connect().await);

    client.send(b"payload").await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"payload");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn inproc_connect_to_unbound_endpoint_is_refused() {
    let mut client = create_transport("inproc://nobody-lives-here").unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionRefused(_)));
}

#[tokio::test]
async fn inproc_rebinding_a_live_endpoint_fails() {
    let mut first = create_transport("inproc://transport-test-b").unwrap();
    first.bind().await.unwrap();

    let mut second = create_transport("inproc://transport-test-b").unwrap();
    let err = second.bind().await.unwrap_err();
    assert!(matches!(err, TransportError::AddrInUse(_)));

    // close releases the name for a later bind
    first.close().await.unwrap();
    let mut third = create_transport("inproc://transport-test-b").unwrap();
    third.bind().await.unwrap();
    third.close().await.unwrap();
}

#[tokio::test]
async fn send_before_connect_is_an_error() {
    let mut t = create_transport("inproc://transport-test-c").unwrap();
    let err = t.send(b"x").await.unwrap_err();
    assert!(matches!(err, TransportError::NotConnected));
}
