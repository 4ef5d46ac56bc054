mod common;
use common::*;
use lorawan_lib::crypto;

fn captured_join() -> Vec<u8> {
    push_data(&BASE64.decode(CAPTURED_JOIN).unwrap())
}

#[tokio::test]
async fn test_join_accept_for_known_device() {
    let h = harness([otaa_record()]);
    let response = h.processor.handle_datagram(&captured_join()).await;

    let phy = pull_resp_payload(&response);
    assert_eq!(phy[0], 0x20);
    assert_eq!(phy.len(), 17);

    let accept = JoinAcceptFrame::decode(&phy, &test_key()).unwrap();
    assert!(accept.verify_mic(&test_key()));
    assert_eq!(accept.net_id, "000001".parse().unwrap());
    assert_eq!(accept.rx_delay, 1);

    // Session keys follow from the nonces in the accept
    let (nwk, app) = crypto::derive_session_keys(&accept.app_nonce, &accept.net_id, &"5511".parse().unwrap(), &test_key());
    let by_addr = h.processor.store().lookup(accept.dev_addr).await.unwrap();
    assert_eq!(by_addr.nwk_s_key, Some(nwk));
    assert_eq!(by_addr.app_s_key, Some(app));
    assert_eq!((by_addr.fcnt_up, by_addr.fcnt_down), (0, 0));
    assert!(by_addr.is_join_valid);

    let by_eui = h.processor.store().lookup(OTAA_DEV_EUI.parse::<Eui64>().unwrap()).await.unwrap();
    assert_eq!(by_eui.dev_addr, Some(accept.dev_addr));
}

#[tokio::test]
async fn test_join_accept_carries_configured_radio_settings() {
    let config = ProcessorConfig {
        dl_settings: 0x12,
        rx_delay: 3,
        ..Default::default()
    };
    let h = harness_with_config([otaa_record()], config);
    let phy = pull_resp_payload(&h.processor.handle_datagram(&captured_join()).await);

    let accept = JoinAcceptFrame::decode(&phy, &test_key()).unwrap();
    assert!(accept.verify_mic(&test_key()));
    assert_eq!((accept.dl_settings, accept.rx_delay), (0x12, 3));
}

#[tokio::test]
async fn test_join_accept_scheduled_after_join_delay() {
    let h = harness([otaa_record()]);
    let response = h.processor.handle_datagram(&captured_join()).await;

    let frame = semtech::decode(&response).unwrap();
    let body: PullRespBody = serde_json::from_slice(&frame.body).unwrap();
    assert_eq!(body.txpk.tmst, Some(286781788 + 5_000_000));
    assert_eq!(body.txpk.freq, 868.1);
    assert_eq!(body.txpk.datr, "SF12BW125");
    assert_eq!(body.txpk.powe, 14);
    assert!(body.txpk.ipol);
    assert!(!body.txpk.imme);
}

#[tokio::test]
async fn test_replayed_join_is_dropped() {
    let h = harness([otaa_record()]);
    assert!(!h.processor.handle_datagram(&captured_join()).await.is_empty());

    // Directory refuses the consumed DevNonce
    assert!(h.processor.handle_datagram(&captured_join()).await.is_empty());
    let by_eui = h.processor.store().lookup(OTAA_DEV_EUI.parse::<Eui64>().unwrap()).await.unwrap();
    assert!(!by_eui.is_join_valid);

    // And now it is refused locally
    assert!(h.processor.handle_datagram(&captured_join()).await.is_empty());
}

#[tokio::test]
async fn test_refused_join_keeps_previous_session() {
    let h = harness([otaa_record()]);
    let accept = JoinAcceptFrame::decode(
        &pull_resp_payload(&h.processor.handle_datagram(&captured_join()).await),
        &test_key(),
    )
    .unwrap();

    h.processor.handle_datagram(&captured_join()).await;
    let session = h.processor.store().lookup(accept.dev_addr).await.unwrap();
    assert!(session.is_join_valid);
    assert!(session.nwk_s_key.is_some());
}

#[tokio::test]
async fn test_new_nonce_rejoins_with_new_address_slot() {
    let h = harness([otaa_record()]);
    let first = JoinAcceptFrame::decode(
        &pull_resp_payload(&h.processor.handle_datagram(&captured_join()).await),
        &test_key(),
    )
    .unwrap();

    let rejoin = JoinRequestFrame::new(
        OTAA_APP_EUI.parse().unwrap(),
        OTAA_DEV_EUI.parse().unwrap(),
        "5512".parse().unwrap(),
        &test_key(),
    );
    let second = JoinAcceptFrame::decode(
        &pull_resp_payload(&h.processor.handle_datagram(&push_data(rejoin.as_bytes())).await),
        &test_key(),
    )
    .unwrap();

    assert_ne!(first.app_nonce, second.app_nonce);
    if first.dev_addr != second.dev_addr {
        assert!(!h.processor.store().contains(first.dev_addr));
    }
    assert!(h.processor.store().lookup(second.dev_addr).await.unwrap().is_join_valid);
}

#[tokio::test]
async fn test_unknown_device_join_is_remembered() {
    let h = harness(Vec::<DeviceRecord>::new());
    assert!(h.processor.handle_datagram(&captured_join()).await.is_empty());

    let by_eui = h.processor.store().lookup(OTAA_DEV_EUI.parse::<Eui64>().unwrap()).await.unwrap();
    assert!(!by_eui.is_known_device);

    // Provisioning the device later does not help until restart
    h.directory.insert(otaa_record());
    assert!(h.processor.handle_datagram(&captured_join()).await.is_empty());
}

#[tokio::test]
async fn test_join_with_wrong_app_eui() {
    let mut record = otaa_record();
    record.app_eui = Some("0000000000000001".parse().unwrap());
    let h = harness([record]);

    assert!(h.processor.handle_datagram(&captured_join()).await.is_empty());
    let by_eui = h.processor.store().lookup(OTAA_DEV_EUI.parse::<Eui64>().unwrap()).await.unwrap();
    assert!(by_eui.is_known_device);
    assert!(!by_eui.is_join_valid);
}

#[tokio::test]
async fn test_join_with_bad_mic() {
    let h = harness([otaa_record()]);
    let mut phy = BASE64.decode(CAPTURED_JOIN).unwrap();
    let last = phy.len() - 1;
    phy[last] ^= 0x01;

    assert!(h.processor.handle_datagram(&push_data(&phy)).await.is_empty());
    let by_eui = h.processor.store().lookup(OTAA_DEV_EUI.parse::<Eui64>().unwrap()).await.unwrap();
    assert!(!by_eui.is_join_valid);
}

#[tokio::test]
async fn test_forged_join_keeps_directory_record() {
    let h = harness([otaa_record()]);
    let accept = JoinAcceptFrame::decode(
        &pull_resp_payload(&h.processor.handle_datagram(&captured_join()).await),
        &test_key(),
    )
    .unwrap();
    let dev_eui: Eui64 = OTAA_DEV_EUI.parse().unwrap();
    let keys_before = h.directory.get_keys(&accept.dev_addr).await.unwrap().unwrap();

    // Fresh DevNonce, but signed with a key the device does not have
    let forged = JoinRequestFrame::new(
        OTAA_APP_EUI.parse().unwrap(),
        dev_eui,
        "AAAA".parse().unwrap(),
        &AesKey::default(),
    );
    assert!(h.processor.handle_datagram(&push_data(forged.as_bytes())).await.is_empty());

    let keys_after = h.directory.get_keys(&accept.dev_addr).await.unwrap().unwrap();
    assert_eq!(keys_after, keys_before);
    assert_eq!(h.directory.record(&dev_eui).unwrap().dev_nonce, Some("5511".parse::<DevNonce>().unwrap()));

    // The joined device keeps talking on its address
    let (nwk, app) = crypto::derive_session_keys(&accept.app_nonce, &accept.net_id, &"5511".parse().unwrap(), &test_key());
    let uplink = DataFrame::new(MessageType::UnconfirmedDataUp, accept.dev_addr, 1)
        .with_payload(2, b"{}", &app)
        .sign(&nwk)
        .encode();
    let response = h.processor.handle_datagram(&push_data(&uplink)).await;
    assert_eq!(response.as_ref(), &[0x02, 0x05, 0xDB, 0x01]);
}

#[tokio::test]
async fn test_uplink_after_join() {
    let h = harness([otaa_record()]);
    let phy = pull_resp_payload(&h.processor.handle_datagram(&captured_join()).await);
    let accept = JoinAcceptFrame::decode(&phy, &test_key()).unwrap();
    let (nwk, app) = crypto::derive_session_keys(&accept.app_nonce, &accept.net_id, &"5511".parse().unwrap(), &test_key());

    let uplink = DataFrame::new(MessageType::UnconfirmedDataUp, accept.dev_addr, 1)
        .with_payload(2, br#"{"temp":21.5}"#, &app)
        .sign(&nwk)
        .encode();
    let response = h.processor.handle_datagram(&push_data(&uplink)).await;
    assert_eq!(response.as_ref(), &[0x02, 0x05, 0xDB, 0x01]);

    settle().await;
    let channel = h.telemetry.channel(&OTAA_DEV_EUI.parse().unwrap());
    let uplinks = channel.uplinks().await;
    assert_eq!(uplinks.len(), 1);
    assert_eq!(uplinks[0]["data"]["temp"], 21.5);
    assert_eq!(uplinks[0]["fport"], 2);
}

#[tokio::test]
async fn test_directory_outage_during_join_is_not_cached() {
    let directory = Arc::new(UnavailableDirectory::default());
    let processor = MessageProcessor::new(
        ProcessorConfig::default(),
        directory.clone(),
        Arc::new(MemoryTelemetry::new()),
    );

    assert!(processor.handle_datagram(&captured_join()).await.is_empty());
    assert!(processor.handle_datagram(&captured_join()).await.is_empty());
    assert_eq!(directory.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}
