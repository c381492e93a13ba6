//! Structured list iteration against a live template manager.

use ipfix_parser::list::{ListFlags, ListSemantics, SubTemplateMultiListIter};
use ipfix_parser::record::DrecFlags;
use ipfix_parser::template::{Template, TemplateType};
use ipfix_parser::template_mgr::{SessionType, TemplateManager};
use ipfix_parser::ErrorKind;

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

fn add_template(mgr: &mut TemplateManager, id: u16, fields: &[(u16, u16)]) {
    let (tmplt, _) = Template::parse(TemplateType::Data, &template_bytes(id, fields)).unwrap();
    mgr.template_add(tmplt).unwrap();
}

/// subTemplateMultiList body: block 1 with two records of template 257,
/// block 2 with one record of template 258.
fn multilist_body() -> Vec<u8> {
    let mut data = vec![3]; // allOf
    data.extend_from_slice(&257u16.to_be_bytes());
    data.extend_from_slice(&8u16.to_be_bytes());
    data.extend_from_slice(&80u16.to_be_bytes());
    data.extend_from_slice(&443u16.to_be_bytes());
    data.extend_from_slice(&258u16.to_be_bytes());
    data.extend_from_slice(&8u16.to_be_bytes());
    data.extend_from_slice(&1234u32.to_be_bytes());
    data
}

#[test]
fn multilist_two_blocks_then_end() {
    let mut mgr = TemplateManager::new(SessionType::Udp);
    mgr.set_time(100).unwrap();
    add_template(&mut mgr, 257, &[(7, 2)]);
    add_template(&mut mgr, 258, &[(2, 4)]);
    let snapshot = mgr.snapshot_get().unwrap();

    let data = multilist_body();
    let mut iter = SubTemplateMultiListIter::new(&data, &snapshot, ListFlags::empty()).unwrap();
    assert_eq!(iter.semantic, ListSemantics::AllOf);

    // Block 1: exactly two records.
    let block = iter.next_block().unwrap().unwrap();
    assert_eq!(block.template_id, 257);
    let rec = iter.next_record().unwrap().unwrap();
    assert_eq!(rec.data, &80u16.to_be_bytes());
    let rec = iter.next_record().unwrap().unwrap();
    assert_eq!(rec.data, &443u16.to_be_bytes());
    assert!(iter.next_record().is_none());

    // Block 2: one record.
    let block = iter.next_block().unwrap().unwrap();
    assert_eq!(block.template_id, 258);
    assert!(iter.next_record().unwrap().is_ok());
    assert!(iter.next_record().is_none());

    // End of collection.
    assert!(iter.next_block().is_none());
}

#[test]
fn multilist_after_template_removal() {
    let mut mgr = TemplateManager::new(SessionType::Udp);
    mgr.set_time(100).unwrap();
    add_template(&mut mgr, 257, &[(7, 2)]);
    add_template(&mut mgr, 258, &[(2, 4)]);

    // Template 257 disappears from the current view.
    mgr.template_remove(257, None).unwrap();
    let snapshot = mgr.snapshot_get().unwrap();

    let data = multilist_body();

    // Without REPORT the first block is silently skipped.
    let mut iter = SubTemplateMultiListIter::new(&data, &snapshot, ListFlags::empty()).unwrap();
    let block = iter.next_block().unwrap().unwrap();
    assert_eq!(block.template_id, 258);
    assert!(iter.next_block().is_none());

    // With REPORT the missing block surfaces NotFound, then block 2
    // proceeds normally.
    let mut iter = SubTemplateMultiListIter::new(&data, &snapshot, ListFlags::REPORT).unwrap();
    let err = iter.next_block().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let block = iter.next_block().unwrap().unwrap();
    assert_eq!(block.template_id, 258);
    let rec = iter.next_record().unwrap().unwrap();
    assert_eq!(rec.data, &1234u32.to_be_bytes());
    assert!(iter.next_record().is_none());
    assert!(iter.next_block().is_none());
}

#[test]
fn nested_records_decode_with_their_own_template() {
    let mut mgr = TemplateManager::new(SessionType::Udp);
    mgr.set_time(100).unwrap();
    add_template(&mut mgr, 257, &[(7, 2), (11, 2)]);
    let snapshot = mgr.snapshot_get().unwrap();

    let mut data = vec![2]; // oneOrMoreOf
    data.extend_from_slice(&257u16.to_be_bytes());
    data.extend_from_slice(&12u16.to_be_bytes());
    data.extend_from_slice(&40000u16.to_be_bytes());
    data.extend_from_slice(&443u16.to_be_bytes());
    data.extend_from_slice(&41000u16.to_be_bytes());
    data.extend_from_slice(&8080u16.to_be_bytes());

    let mut iter = SubTemplateMultiListIter::new(&data, &snapshot, ListFlags::empty()).unwrap();
    iter.next_block().unwrap().unwrap();

    let rec = iter.next_record().unwrap().unwrap();
    let fields: Vec<_> = rec
        .iter(DrecFlags::empty())
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].id, 7);
    assert_eq!(fields[0].data, &40000u16.to_be_bytes());
    assert_eq!(fields[1].data, &443u16.to_be_bytes());

    // Nested records carry the snapshot for deeper nesting.
    assert!(rec.snapshot.is_some());
}
