use anyhow::Result;
use remote::PortRanges;
use remote::protocol::command::DataPortAddr;
use remote::protocol::reply::{ConfigOffer, Reply};
use remote::protocol::{Command, Verb};
use remote::streams::ControlConnection;
use remote::{Crew, CrewConfig};

#[tokio::test]
async fn test_dataport_binding_with_ranges() -> Result<()> {
    // distinct from the unit test ranges so parallel runs do not collide
    let ranges: PortRanges = "20000-20999".parse()?;
    let listener = remote::dataport::bind_listener(
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        Some(&ranges),
    )
    .await?;
    let addr = listener.local_addr()?;
    assert!(
        (20000..=20999).contains(&addr.port()),
        "Port {} should be within range 20000-20999",
        addr.port()
    );
    let accepted = tokio::spawn(async move {
        remote::dataport::accept(&listener, std::time::Duration::from_secs(5)).await
    });
    remote::dataport::connect(addr, std::time::Duration::from_secs(5)).await?;
    accepted.await??;
    Ok(())
}

/// Minimal server side: handshake, then connect back to every announced
/// dataport.
async fn serve_handshake(
    listener: tokio::net::TcpListener,
    offer: ConfigOffer,
) -> Result<(ControlConnection, Crew)> {
    let (stream, _) = listener.accept().await?;
    let mut control = ControlConnection::new(stream, remote::protocol::DEFAULT_CMD_BUFFER_SIZE);
    assert_eq!(control.recv_command().await?, Some(Command::Connect));
    control.send_reply(&Reply::ok(Verb::Connect, 0)).await?;
    let Some(Command::Config { hostname }) = control.recv_command().await? else {
        anyhow::bail!("expected CONFIG");
    };
    assert_eq!(hostname.as_deref(), Some("tester"));
    control.send_reply(&offer.reply()).await?;
    let mut sockets = Vec::new();
    for _ in 0..offer.dataports {
        let Some(Command::Dport6(DataPortAddr { seq, addr })) = control.recv_command().await?
        else {
            anyhow::bail!("expected DPORT6");
        };
        assert_eq!(seq, sockets.len());
        sockets.push(remote::dataport::connect(addr, std::time::Duration::from_secs(5)).await?);
        control.send_reply(&Reply::ok(Verb::Dport6, 0)).await?;
    }
    let crew = Crew::new(
        CrewConfig {
            dataports: offer.dataports,
            blksize: offer.blksize,
            tcp_window: offer.tcp_window,
            read_timeout: std::time::Duration::from_millis(200),
        },
        sockets,
        tracing::info_span!("server"),
    )?;
    Ok((control, crew))
}

#[tokio::test]
async fn test_handshake_and_striped_transfer_over_loopback() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let offer = ConfigOffer {
        dataports: 3,
        blksize: 1000,
        tcp_window: 0,
    };
    let server = tokio::spawn(serve_handshake(listener, offer));

    let stream = tokio::net::TcpStream::connect(addr).await?;
    let mut control = ControlConnection::new(stream, remote::protocol::DEFAULT_CMD_BUFFER_SIZE);
    control.call(&Command::Connect).await?.check()?;
    let reply = control
        .call(&Command::Config {
            hostname: Some("tester".to_string()),
        })
        .await?
        .check()?;
    let offered = ConfigOffer::from_reply(&reply)?;
    assert_eq!(offered, offer);
    let mut sockets = Vec::new();
    for seq in 0..offered.dataports {
        let dataport = remote::dataport::bind_listener(control.local_addr()?.ip(), None).await?;
        let addr = dataport.local_addr()?;
        control
            .call(&Command::Dport6(DataPortAddr { seq, addr }))
            .await?
            .check()?;
        sockets.push(remote::dataport::accept(&dataport, std::time::Duration::from_secs(5)).await?);
    }
    let client_crew = Crew::new(
        CrewConfig {
            dataports: offered.dataports,
            blksize: offered.blksize,
            tcp_window: offered.tcp_window,
            read_timeout: std::time::Duration::from_millis(200),
        },
        sockets,
        tracing::info_span!("client"),
    )?;
    let (_server_control, server_crew) = server.await??;

    let data: Vec<u8> = (0..10_500u32).map(|i| (i % 251) as u8).collect();
    let (sent, received) = tokio::join!(
        client_crew.send_data(&data),
        server_crew.receive_data(data.len())
    );
    sent?;
    assert_eq!(received?, data);

    // and back the other way
    let (sent, received) = tokio::join!(
        server_crew.send_data(&data[..999]),
        client_crew.receive_data(4096)
    );
    sent?;
    assert_eq!(received?, &data[..999]);

    client_crew.shutdown().await;
    server_crew.shutdown().await;
    Ok(())
}
