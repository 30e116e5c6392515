use fgnet_server::server::bind_ephemeral;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64).await?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.tick_count(), 3);

    let status = server.status_lines();
    assert!(status.iter().any(|l| l == "Tick: 3"));
    assert!(status.iter().any(|l| l == "Clients: 0"));
    Ok(())
}

/// Console netsim rejects out-of-range settings and keeps the old ones.
#[tokio::test]
async fn console_netsim_validates() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64).await?;
    server.exec_console("netsim 20 80 5")?;
    server.exec_console("netsim 90 10 5")?;
    assert!(server
        .status_lines()
        .iter()
        .any(|l| l == "Netsim: 20-80 ms, 5% loss"));
    Ok(())
}
