//! Template manager lifecycle across transport session types.

use ipfix_parser::template::{Template, TemplateType};
use ipfix_parser::template_mgr::{SessionType, TemplateManager};
use ipfix_parser::{ErrorKind, IeManager};

use std::sync::Arc;

fn template_bytes(id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    for (fid, len) in fields {
        buf.extend_from_slice(&fid.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
    }
    buf
}

fn parse(id: u16, fields: &[(u16, u16)]) -> Template {
    Template::parse(TemplateType::Data, &template_bytes(id, fields))
        .unwrap()
        .0
}

#[test]
fn udp_refresh_semantics() {
    let mut mgr = TemplateManager::new(SessionType::Udp);

    // t=1000: define template 50000 with raw bytes B.
    mgr.set_time(1000).unwrap();
    mgr.template_add(parse(50000, &[(8, 4), (12, 4)])).unwrap();

    // t=1060: the same bytes refresh the timestamps only.
    mgr.set_time(1060).unwrap();
    mgr.template_add(parse(50000, &[(8, 4), (12, 4)])).unwrap();
    let tmplt = mgr.template_get(50000).unwrap();
    assert_eq!(tmplt.first_seen, 1000);
    assert_eq!(tmplt.last_seen, 1060);

    // t=1120: different bytes redefine the template.
    mgr.set_time(1120).unwrap();
    mgr.template_add(parse(50000, &[(8, 4), (12, 4), (7, 2)]))
        .unwrap();
    let tmplt = mgr.template_get(50000).unwrap();
    assert_eq!(tmplt.first_seen, 1120);
    assert_eq!(tmplt.last_seen, 1120);
    assert_eq!(tmplt.fields_cnt_total, 3);
}

#[test]
fn tcp_replacement_denied_without_withdrawal() {
    let mut mgr = TemplateManager::new(SessionType::Tcp);

    mgr.set_time(100).unwrap();
    mgr.template_add(parse(300, &[(8, 4)])).unwrap();

    // Snapshot from an intermediate time.
    mgr.set_time(150).unwrap();
    let old_view = mgr.snapshot_get().unwrap();

    // t=200: replacement without withdrawal is denied.
    mgr.set_time(200).unwrap();
    let err = mgr.template_add(parse(300, &[(27, 16)])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Denied);

    // Withdraw, then the same id takes a new definition.
    mgr.template_withdraw(300, Some(TemplateType::Data)).unwrap();
    mgr.template_add(parse(300, &[(27, 16)])).unwrap();
    assert_eq!(mgr.template_get(300).unwrap().fields[0].id, 27);

    // The old snapshot still sees the original template.
    assert_eq!(old_view.get(300).unwrap().fields[0].id, 8);
    assert_eq!(old_view.export_time(), 150);
}

#[test]
fn sctp_requires_withdrawal_too() {
    let mut mgr = TemplateManager::new(SessionType::Sctp);
    mgr.set_time(10).unwrap();
    mgr.template_add(parse(256, &[(8, 4)])).unwrap();

    mgr.set_time(20).unwrap();
    assert_eq!(
        mgr.template_add(parse(256, &[(12, 4)])).unwrap_err().kind(),
        ErrorKind::Denied
    );

    // SCTP may navigate backwards, unlike TCP.
    mgr.set_time(5).unwrap();
    assert_eq!(
        mgr.template_get(256).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn wraparound_visibility() {
    for session in [SessionType::Udp, SessionType::Sctp, SessionType::File] {
        let mut mgr = TemplateManager::new(session);
        mgr.set_time(u32::MAX - 10).unwrap();
        mgr.template_add(parse(400, &[(1, 8)])).unwrap();

        mgr.set_time(10).unwrap();
        assert!(
            mgr.template_get(400).is_ok(),
            "template invisible after wraparound on {session:?}"
        );
    }
}

#[test]
fn garbage_lives_until_batch_drop() {
    let mut mgr = TemplateManager::new(SessionType::Udp);
    mgr.set_time(100).unwrap();
    mgr.template_add(parse(256, &[(8, 4)])).unwrap();

    let snapshot = mgr.snapshot_get().unwrap();
    let held = Arc::clone(snapshot.get(256).unwrap());

    mgr.template_remove(256, None).unwrap();
    let batch = mgr.garbage_get();
    assert_eq!(batch.len(), 1);

    // Both the snapshot and the explicit handle keep the template alive
    // after the batch is dropped.
    drop(batch);
    assert_eq!(held.id, 256);
    assert_eq!(snapshot.get(256).unwrap().id, 256);
}

#[test]
fn set_iemgr_redefines_cached_templates() {
    let doc = r#"<ipfix-elements>
      <scope><pen>0</pen><name>iana</name>
        <element><id>8</id><name>sourceIPv4Address</name><dataType>ipv4Address</dataType></element>
        <element><id>292</id><name>subTemplateList</name><dataType>subTemplateList</dataType></element>
      </scope>
    </ipfix-elements>"#;
    let mut iemgr = IeManager::new();
    iemgr.load_elements_str(doc, false).unwrap();

    let mut mgr = TemplateManager::new(SessionType::Udp);
    mgr.set_time(100).unwrap();
    mgr.template_add(parse(256, &[(8, 4), (292, 65535)])).unwrap();

    // Without definitions nothing is resolved.
    assert!(mgr.template_get(256).unwrap().fields[0].def.is_none());

    mgr.set_iemgr(Some(Arc::new(iemgr)));
    let tmplt = mgr.template_get(256).unwrap();
    assert_eq!(
        tmplt.fields[0].def.as_ref().unwrap().name,
        "sourceIPv4Address"
    );
    assert!(
        tmplt.flags
            .contains(ipfix_parser::template::TemplateFlags::STRUCT)
    );

    // Clearing the manager keeps templates but drops definitions and the
    // derived flags.
    mgr.set_iemgr(None);
    let tmplt = mgr.template_get(256).unwrap();
    assert!(tmplt.fields[0].def.is_none());
    assert!(
        !tmplt.flags
            .contains(ipfix_parser::template::TemplateFlags::STRUCT)
    );
}

#[test]
fn file_session_allows_replacement_and_withdrawal() {
    let mut mgr = TemplateManager::new(SessionType::File);
    mgr.set_time(100).unwrap();
    mgr.template_add(parse(256, &[(8, 4)])).unwrap();

    // In-place replacement like UDP.
    mgr.set_time(150).unwrap();
    mgr.template_add(parse(256, &[(12, 4)])).unwrap();
    assert_eq!(mgr.template_get(256).unwrap().fields[0].id, 12);

    // Withdrawal like SCTP/TCP.
    mgr.set_time(200).unwrap();
    mgr.template_withdraw(256, None).unwrap();
    assert!(mgr.template_get(256).is_err());
}

#[test]
fn options_templates_round_trip_through_manager() {
    let mut raw = Vec::new();
    raw.extend_from_slice(&1000u16.to_be_bytes());
    raw.extend_from_slice(&2u16.to_be_bytes());
    raw.extend_from_slice(&1u16.to_be_bytes()); // scope count
    raw.extend_from_slice(&149u16.to_be_bytes());
    raw.extend_from_slice(&4u16.to_be_bytes());
    raw.extend_from_slice(&41u16.to_be_bytes());
    raw.extend_from_slice(&8u16.to_be_bytes());

    let (tmplt, consumed) = Template::parse(TemplateType::Options, &raw).unwrap();
    assert_eq!(consumed, raw.len());
    assert_eq!(tmplt.raw, raw);

    let mut mgr = TemplateManager::new(SessionType::Tcp);
    mgr.set_time(5).unwrap();
    mgr.template_add(tmplt).unwrap();

    let stored = mgr.template_get(1000).unwrap();
    assert_eq!(stored.ttype, TemplateType::Options);
    assert_eq!(stored.fields_cnt_scope, 1);

    // Withdrawal with the wrong type hint is rejected.
    assert_eq!(
        mgr.template_withdraw(1000, Some(TemplateType::Data))
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArg
    );
}
