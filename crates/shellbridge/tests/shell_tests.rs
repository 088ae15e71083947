//! Integration tests for shell sessions.
//!
//! Tests cover:
//! - session start (status, banner, PTY parameters)
//! - several sessions per client
//! - input routing and resize
//! - output forwarding and remote termination
//! - connection and shell allocation failures
//! - teardown convergence

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{ConnectBehavior, DEVICE, DEVICE_HOST, Harness, client, drain, recv_until, wait_until};
use shellbridge::protocol::StartSession;
use shellbridge::{
    Channel, ClientHandle, Error, RemoteTermination, ServerEvent, SessionId, ShellInput,
    ShellOutput, ShellState, StatusKind, StatusMessage, TerminalGeometry,
};

fn start_request(rows: Option<u32>, cols: Option<u32>) -> StartSession {
    StartSession {
        device_uuid: DEVICE.to_string(),
        rows,
        cols,
    }
}

async fn start(harness: &Harness, client: &ClientHandle) -> SessionId {
    harness
        .adapter
        .shell()
        .start_session(client, start_request(None, None))
        .await
        .expect("shell session starts")
}

fn statuses(events: &[ServerEvent], kind: StatusKind) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::Status {
                channel: Channel::Shell,
                status: StatusMessage { status, message },
            } if *status == kind => Some(message.clone().unwrap_or_default()),
            _ => None,
        })
        .collect()
}

fn is_disconnect(event: &ServerEvent) -> bool {
    matches!(
        event,
        ServerEvent::Status {
            status: StatusMessage {
                status: StatusKind::Disconnect,
                ..
            },
            ..
        }
    )
}

mod start_tests {
    use super::*;

    #[tokio::test]
    async fn test_start_announces_session() {
        let harness = Harness::new();
        harness.connector.set_banner("Welcome\nauthorized use only\n");
        let (client, mut rx) = client();

        let id = start(&harness, &client).await;
        let events = drain(&mut rx);

        assert_eq!(statuses(&events, StatusKind::Ok), ["SSH CONNECTION ESTABLISHED"]);
        assert!(events.contains(&ServerEvent::ShellData(
            "Welcome\r\nauthorized use only\r\n".into()
        )));
        assert!(events.contains(&ServerEvent::ShellData(format!(
            "Connected to device: {DEVICE} on {DEVICE_HOST}!\r\n---\r\n"
        ))));

        let registry = harness.adapter.shell().registry();
        assert_eq!(registry.sessions_of(client.id()), vec![id]);
        let session = registry.get(id).unwrap();
        assert_eq!(session.state(), ShellState::Streaming);
        assert_eq!(session.host(), DEVICE_HOST);
    }

    #[tokio::test]
    async fn test_default_pty_parameters() {
        let harness = Harness::new();
        let (client, _rx) = client();
        start(&harness, &client).await;

        let endpoint = harness.connector.last_connection().shell();
        assert_eq!(endpoint.request.term, "xterm-256color");
        assert_eq!(
            endpoint.request.geometry,
            TerminalGeometry {
                rows: 24,
                cols: 80,
                height: 480,
                width: 640,
            }
        );
    }

    #[tokio::test]
    async fn test_requested_dimensions_are_used() {
        let harness = Harness::new();
        let (client, _rx) = client();
        harness
            .adapter
            .shell()
            .start_session(&client, start_request(Some(50), Some(200)))
            .await
            .unwrap();

        let geometry = harness.connector.last_connection().shell().request.geometry;
        assert_eq!((geometry.rows, geometry.cols), (50, 200));
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_distinct_sessions() {
        let harness = Harness::new();
        let (client, _rx) = client();
        let shell = harness.adapter.shell();

        let (a, b) = tokio::join!(
            shell.start_session(&client, start_request(None, None)),
            shell.start_session(
                &client,
                StartSession {
                    device_uuid: "dev-2".into(),
                    rows: None,
                    cols: None,
                },
            ),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a, b);
        assert_eq!(harness.connector.connections().len(), 2);
        let owned = shell.registry().sessions_of(client.id());
        assert_eq!(owned.len(), 2);
        assert!(owned.contains(&a) && owned.contains(&b));
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_auth_failure_names_client_origin() {
        let harness = Harness::new();
        harness.connector.set_behavior(ConnectBehavior::RejectAuth);
        let origin: SocketAddr = "203.0.113.7:51000".parse().unwrap();
        let (client, mut rx) = ClientHandle::channel(Some(origin), 64);

        let err = harness
            .adapter
            .shell()
            .start_session(&client, start_request(None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure));

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events, StatusKind::Disconnect),
            ["Authentication failure from=203.0.113.7:51000"]
        );
        assert_eq!(harness.adapter.shell().registry().session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_device_reports_disconnect() {
        let harness = Harness::new();
        let (client, mut rx) = client();

        let result = harness
            .adapter
            .shell()
            .start_session(
                &client,
                StartSession {
                    device_uuid: "nope".into(),
                    rows: None,
                    cols: None,
                },
            )
            .await;
        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
        assert_eq!(
            statuses(&drain(&mut rx), StatusKind::Disconnect),
            ["device not found: nope"]
        );
    }

    #[tokio::test]
    async fn test_connect_timeout_reports_disconnect() {
        let harness = Harness::with_config(|config| config.ssh.connect_timeout_secs = 1);
        harness.connector.set_behavior(ConnectBehavior::Hang);
        let (client, mut rx) = client();

        let result = harness
            .adapter
            .shell()
            .start_session(&client, start_request(None, None))
            .await;
        assert!(matches!(result, Err(Error::ConnectionTimeout)));
        assert_eq!(
            statuses(&drain(&mut rx), StatusKind::Disconnect),
            ["Connection Timeout"]
        );
    }

    #[tokio::test]
    async fn test_shell_allocation_failure_tears_down() {
        let harness = Harness::new();
        harness.connector.fail_shells();
        let (client, mut rx) = client();

        let result = harness
            .adapter
            .shell()
            .start_session(&client, start_request(None, None))
            .await;
        assert!(matches!(result, Err(Error::ShellAllocation(_))));

        let events = drain(&mut rx);
        assert_eq!(statuses(&events, StatusKind::Ok).len(), 1);
        assert_eq!(statuses(&events, StatusKind::Error).len(), 1);
        assert_eq!(harness.adapter.shell().registry().session_count(), 0);
        assert_eq!(harness.connector.last_connection().close_count(), 1);
    }
}

mod stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_input_goes_to_first_session_by_default() {
        let harness = Harness::new();
        let (client, _rx) = client();
        start(&harness, &client).await;
        start(&harness, &client).await;
        let connections = harness.connector.connections();

        harness.adapter.shell().send_data(&client, "ls -la\r", None);

        assert_eq!(
            connections[0].shell().next_input().await,
            Some(ShellInput::Data(b"ls -la\r".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_input_addressed_by_session_id() {
        let harness = Harness::new();
        let (client, _rx) = client();
        start(&harness, &client).await;
        let second = start(&harness, &client).await;
        let connections = harness.connector.connections();

        harness
            .adapter
            .shell()
            .send_data(&client, "uptime\r", Some(second));

        assert_eq!(
            connections[1].shell().next_input().await,
            Some(ShellInput::Data(b"uptime\r".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_input_for_foreign_session_is_dropped() {
        let harness = Harness::new();
        let (owner, _owner_rx) = client();
        let (other, _other_rx) = client();
        let id = start(&harness, &owner).await;

        harness.adapter.shell().send_data(&other, "rm -rf /\r", Some(id));
        harness.adapter.shell().send_data(&owner, "id\r", Some(id));

        let endpoint = harness.connector.last_connection().shell();
        assert_eq!(
            endpoint.next_input().await,
            Some(ShellInput::Data(b"id\r".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_resize_keeps_pixel_size() {
        let harness = Harness::new();
        let (client, _rx) = client();
        let id = start(&harness, &client).await;

        let geometry = harness.adapter.shell().resize(&client, 40, 120, None);
        let expected = TerminalGeometry {
            rows: 40,
            cols: 120,
            height: 480,
            width: 640,
        };
        assert_eq!(geometry, Some(expected));

        let endpoint = harness.connector.last_connection().shell();
        assert_eq!(endpoint.next_input().await, Some(ShellInput::Resize(expected)));
        let session = harness.adapter.shell().registry().get(id).unwrap();
        assert_eq!(session.geometry(), expected);
    }

    #[tokio::test]
    async fn test_resize_without_session() {
        let harness = Harness::new();
        let (client, _rx) = client();
        assert_eq!(harness.adapter.shell().resize(&client, 40, 120, None), None);
    }

    #[tokio::test]
    async fn test_output_is_forwarded_in_order() {
        let harness = Harness::new();
        let (client, mut rx) = client();
        start(&harness, &client).await;
        drain(&mut rx);

        let endpoint = harness.connector.last_connection().shell();
        endpoint.send_output(b"total 0\r\n").await;
        // A multi-byte character split across two reads.
        let check = "✓".as_bytes();
        endpoint.send_output(&check[..1]).await;
        endpoint.send_output(&check[1..]).await;
        endpoint.send_output(b"$ ").await;

        let events = recv_until(&mut rx, |event| {
            matches!(event, ServerEvent::ShellData(text) if text == "$ ")
        })
        .await;
        let text: String = events
            .iter()
            .filter_map(|event| match event {
                ServerEvent::ShellData(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "total 0\r\n✓$ ");
    }

    #[tokio::test]
    async fn test_stderr_is_not_forwarded() {
        let harness = Harness::new();
        let (client, mut rx) = client();
        start(&harness, &client).await;
        drain(&mut rx);

        let endpoint = harness.connector.last_connection().shell();
        endpoint
            .output
            .send(ShellOutput::Stderr(b"warning".to_vec()))
            .await
            .unwrap();
        endpoint.send_output(b"ok").await;

        let events = recv_until(&mut rx, |event| {
            matches!(event, ServerEvent::ShellData(text) if text == "ok")
        })
        .await;
        assert_eq!(events, vec![ServerEvent::ShellData("ok".into())]);
    }
}

mod teardown_tests {
    use super::*;

    #[tokio::test]
    async fn test_remote_eof_ends_session() {
        let harness = Harness::new();
        let (client, mut rx) = client();
        start(&harness, &client).await;

        let connection = harness.connector.last_connection();
        connection.shell().output.send(ShellOutput::Eof).await.unwrap();

        let events = recv_until(&mut rx, is_disconnect).await;
        assert_eq!(
            statuses(&events, StatusKind::Disconnect),
            ["SSH CONNECTION ENDED"]
        );
        let registry = harness.adapter.shell().registry();
        wait_until(|| registry.session_count() == 0).await;
        assert_eq!(connection.close_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_error_is_reported() {
        let harness = Harness::new();
        let (client, mut rx) = client();
        start(&harness, &client).await;

        harness
            .connector
            .last_connection()
            .terminate(RemoteTermination::Error("Connection reset by peer".into()));

        let events = recv_until(&mut rx, is_disconnect).await;
        assert_eq!(
            statuses(&events, StatusKind::Disconnect),
            ["Connection reset by peer"]
        );
    }

    #[tokio::test]
    async fn test_explicit_close() {
        let harness = Harness::new();
        let (client, mut rx) = client();
        let id = start(&harness, &client).await;
        let connection = harness.connector.last_connection();
        let endpoint = connection.shell();
        drain(&mut rx);

        harness
            .adapter
            .shell()
            .close_session(&client, Some(id))
            .await
            .unwrap();

        assert_eq!(harness.adapter.shell().registry().session_count(), 0);
        assert_eq!(connection.close_count(), 1);
        assert_eq!(endpoint.next_input().await, Some(ShellInput::End));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut rx).iter().all(|event| !is_disconnect(event)));
    }

    #[tokio::test]
    async fn test_close_without_session() {
        let harness = Harness::new();
        let (client, _rx) = client();
        let err = harness
            .adapter
            .shell()
            .close_session(&client, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveSession));
        assert_eq!(err.to_string(), "No active session");
    }

    #[tokio::test]
    async fn test_remote_close_racing_disconnect_releases_once() {
        let harness = Harness::new();
        let (client, mut rx) = client();
        start(&harness, &client).await;
        start(&harness, &client).await;
        let connections = harness.connector.connections();

        tokio::join!(
            async { connections[0].terminate(RemoteTermination::Close) },
            harness.adapter.on_disconnect(&client),
        );

        let registry = harness.adapter.shell().registry();
        wait_until(|| registry.session_count() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        for connection in &connections {
            assert_eq!(connection.close_count(), 1);
        }
        let disconnects = drain(&mut rx).iter().filter(|e| is_disconnect(e)).count();
        assert!(disconnects <= 1);
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_then_remote_close_releases_once() {
        let harness = Harness::new();
        let (client, mut rx) = client();
        start(&harness, &client).await;
        let connection = harness.connector.last_connection();
        drain(&mut rx);

        harness.adapter.on_disconnect(&client).await;
        connection.terminate(RemoteTermination::Close);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(connection.close_count(), 1);
        assert_eq!(harness.adapter.shell().registry().session_count(), 0);
        assert!(drain(&mut rx).iter().all(|event| !is_disconnect(event)));
    }

    #[tokio::test]
    async fn test_start_in_flight_during_disconnect_is_dropped() {
        let harness = Harness::new();
        harness
            .connector
            .set_behavior(ConnectBehavior::Delay(Duration::from_millis(200)));
        let (client, rx) = client();

        let shell = std::sync::Arc::clone(harness.adapter.shell());
        let starting = {
            let client = client.clone();
            tokio::spawn(async move { shell.start_session(&client, start_request(None, None)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(rx);
        harness.adapter.on_disconnect(&client).await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(Error::ClientDisconnected)));
        assert_eq!(harness.adapter.shell().registry().session_count(), 0);
        assert_eq!(harness.connector.last_connection().close_count(), 1);
    }

    #[tokio::test]
    async fn test_output_for_departed_client_closes_session() {
        let harness = Harness::new();
        let (client, rx) = client();
        start(&harness, &client).await;
        let connection = harness.connector.last_connection();
        let endpoint = connection.shell();

        drop(rx);
        endpoint.send_output(b"still there?").await;

        let registry = harness.adapter.shell().registry();
        wait_until(|| registry.session_count() == 0).await;
        assert_eq!(connection.close_count(), 1);
    }

    #[tokio::test]
    async fn test_input_after_close_is_dropped() {
        let harness = Harness::new();
        let (client, _rx) = client();
        let id = start(&harness, &client).await;
        harness
            .adapter
            .shell()
            .close_session(&client, Some(id))
            .await
            .unwrap();

        harness.adapter.shell().send_data(&client, "ls\r", Some(id));
        harness.adapter.shell().send_data(&client, "ls\r", None);
        assert_eq!(harness.adapter.shell().registry().session_count(), 0);
    }
}
