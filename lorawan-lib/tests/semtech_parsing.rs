mod common;
use common::*;

#[test]
fn test_pull_data_has_eui_and_no_body() {
    let frame = semtech::decode(&hex_to_bytes("0212AB02AA555A0000000101")).unwrap();
    assert_eq!(frame.identifier, Identifier::PullData);
    assert_eq!(frame.token, [0x12, 0xAB]);
    assert_eq!(frame.gateway_eui, Some("AA555A0000000101".parse().unwrap()));
    assert!(frame.body.is_empty());
}

#[test]
fn test_push_data_body_runs_to_end() {
    let datagram = push_data(&hex_to_bytes("4046B92800803700085E24403830FA8120873129"));
    let frame = semtech::decode(&datagram).unwrap();
    assert_eq!(frame.identifier, Identifier::PushData);
    assert_eq!(frame.body.len(), datagram.len() - 12);
    assert_eq!(frame.body[0], b'{');
}

#[test]
fn test_short_buffers_are_truncated() {
    assert!(matches!(
        semtech::decode(&[0x02, 0x05]),
        Err(LoraError::TruncatedFrame { expected: 4, actual: 2 })
    ));
    // PULL_DATA needs the 8-byte gateway EUI
    assert!(matches!(
        semtech::decode(&hex_to_bytes("0205DB02AA55")),
        Err(LoraError::TruncatedFrame { expected: 12, actual: 6 })
    ));
}

#[test]
fn test_unknown_identifier_is_malformed() {
    assert!(matches!(
        semtech::decode(&hex_to_bytes("0205DB09")),
        Err(LoraError::MalformedFrame(_))
    ));
}

#[test]
fn test_acks_are_token_only() {
    let request = semtech::decode(&hex_to_bytes("0205DB02AA555A0000000101")).unwrap();
    let ack = GatewayFrame::ack(Identifier::PullAck, &request).to_bytes();
    assert_eq!(ack.as_ref(), &[0x02, 0x05, 0xDB, 0x04]);

    let encoded = semtech::encode(Identifier::PushAck, [0xAA, 0xBB], b"ignored");
    assert_eq!(encoded.as_ref(), &[0x02, 0xAA, 0xBB, 0x01]);
}

#[test]
fn test_pull_resp_layout() {
    let encoded = semtech::encode(Identifier::PullResp, [0x01, 0x02], br#"{"txpk":{}}"#);
    assert_eq!(&encoded[..4], &[0x02, 0x01, 0x02, 0x03]);
    assert_eq!(&encoded[4..], br#"{"txpk":{}}"#);

    let decoded = semtech::decode(&encoded).unwrap();
    assert_eq!(decoded.identifier, Identifier::PullResp);
    assert!(decoded.gateway_eui.is_none());
}

#[test]
fn test_rxpk_missing_required_field() {
    // no "data"
    let body = br#"{"rxpk":[{"tmst":1,"freq":868.1,"datr":"SF7BW125","size":0}]}"#;
    assert!(matches!(
        semtech::PushDataBody::parse(body),
        Err(LoraError::MalformedFrame(_))
    ));
}

#[test]
fn test_txpk_replies_in_same_channel() {
    let body = format!("{{\"rxpk\":[{}]}}", rxpk_json(b"\x40abc", 4_294_000_000));
    let parsed = semtech::PushDataBody::parse(body.as_bytes()).unwrap();
    let rxpk = parsed.first_rxpk().unwrap();

    let txpk = semtech::Txpk::reply_to(rxpk, b"\x20xyz", 1_000_000, 14);
    // Concentrator timestamps wrap around
    assert_eq!(txpk.tmst, Some(4_294_000_000u32.wrapping_add(1_000_000)));
    assert_eq!(txpk.freq, rxpk.freq);
    assert_eq!(txpk.datr, "SF12BW125");
    assert_eq!(txpk.codr, "4/5");
    assert_eq!(txpk.size, 4);
    assert_eq!(txpk.payload().unwrap().as_ref(), b"\x20xyz");
}

#[test]
fn test_tx_ack_bodies() {
    assert!(semtech::TxAckBody::parse(b"").unwrap().is_accepted());
    assert!(semtech::TxAckBody::parse(br#"{"txpk_ack":{"error":"NONE"}}"#).unwrap().is_accepted());
    assert!(!semtech::TxAckBody::parse(br#"{"txpk_ack":{"error":"TOO_LATE"}}"#).unwrap().is_accepted());
}
