//! End-to-end scenarios driven through the composition root: stage,
//! commit, read back, delete, and verify, all over an in-memory store.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bendo::config::Config;
use bendo::content::Content;
use bendo::error::{CResult, Error};
use bendo::server::Server;
use bendo::store::memory::Memory;
use bendo::store::Store;
use bendo::tx::{commands_from_json, Command, TxRecord, TxStatus};

fn server() -> CResult<Server> {
    let server = Server::new(Config::default(), Arc::new(Memory::new()))?;
    server.start()?;
    Ok(server)
}

fn server_over(store: Arc<dyn Store>, config: Config) -> CResult<Server> {
    let server = Server::new(config, store)?;
    server.start()?;
    Ok(server)
}

/// Stages an upload with the given content, returning its id.
fn stage(server: &Server, content: &[u8]) -> CResult<String> {
    let upload = server.new_upload("tester")?;
    let mut w = upload.append()?;
    w.write_all(content).map_err(Error::from)?;
    w.close()?;
    Ok(upload.id().to_string())
}

/// Runs a transaction to completion and returns its terminal record.
fn commit(server: &Server, item: &str, commands: Vec<Command>) -> CResult<TxRecord> {
    let tx = server.create_transaction(item, "tester", commands)?;
    wait_terminal(server, &tx)
}

fn wait_terminal(server: &Server, tx: &str) -> CResult<TxRecord> {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(rec) = server.transaction(tx)? {
            if rec.status.terminal() {
                return Ok(rec);
            }
        }
        if Instant::now() > deadline {
            return Err(Error::Timeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn read_content(content: Content) -> CResult<Vec<u8>> {
    let mut reader = match content {
        Content::Cached { reader, .. } => reader,
        Content::Large { reader, .. } => reader,
        Content::Waiting => return Err(Error::Timeout),
    };
    let mut out = Vec::new();
    reader.read_to_end(&mut out).map_err(Error::from)?;
    Ok(out)
}

#[test]
fn basic_add_and_read() -> CResult<()> {
    let server = server()?;

    // Two appended fragments form one file.
    let upload = server.new_upload("tester")?;
    let mut w = upload.append()?;
    w.write_all(b"hello world").map_err(Error::from)?;
    w.close()?;
    let mut w = upload.append()?;
    w.write_all(b" and hello sun").map_err(Error::from)?;
    w.close()?;

    let rec = commit(&server, "zxcv", vec![Command::Add(upload.id().to_string())])?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);
    assert_eq!(rec.blob_map.get(upload.id()), Some(&1));

    let content = server.blob_content("zxcv", 1)?;
    assert_eq!(read_content(content)?, b"hello world and hello sun");
    server.stop();
    Ok(())
}

#[test]
fn delete_and_repack() -> CResult<()> {
    let store: Arc<dyn Store> = Arc::new(Memory::new());
    let server = server_over(store.clone(), Config::default())?;

    let a = stage(&server, b"hello world")?;
    let b = stage(&server, b"delete me")?;
    let rec = commit(
        &server,
        "itm",
        vec![Command::Add(a.clone()), Command::Add(b.clone())],
    )?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    let rec = commit(&server, "itm", vec![Command::Delete(2)])?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    assert_eq!(read_content(server.blob_content("itm", 1)?)?, b"hello world");
    assert_eq!(
        server.blob_content("itm", 2).err(),
        Some(Error::Deleted("itm".into(), 2))
    );

    // The original bundle is gone; a higher-sequence bundle holds blob 1.
    assert!(store.open("itm-0001").is_err());
    assert!(store.open("itm-0002").is_ok());
    let item = server.item("itm")?;
    assert_eq!(item.blob(1).map(|b| b.bundle).ok(), Some(2));
    server.stop();
    Ok(())
}

#[test]
fn bad_hash_upload_rolls_back() -> CResult<()> {
    let server = server()?;

    // The handler flow for a mismatched X-Upload-Md5: append the body,
    // notice the digest disagrees, roll the fragment back.
    let upload = server.new_upload("tester")?;
    let mut w = upload.append()?;
    w.write_all(b"hello world").map_err(Error::from)?;
    w.close()?;
    upload.set_md5(hex::decode("abcdef0123456789abcdef0123456789").expect("hex"))?;
    assert!(!upload.verify()?);
    upload.rollback()?;

    // The upload remains, empty.
    let mut out = Vec::new();
    upload.open()?.read_to_end(&mut out).map_err(Error::from)?;
    assert_eq!(out, b"");
    assert_eq!(upload.stat()?.size, 0);
    server.stop();
    Ok(())
}

#[test]
fn concurrent_transactions_are_rejected() -> CResult<()> {
    let server = server()?;

    let tx = server.create_transaction("abc", "tester", vec![Command::Sleep])?;
    // While the first is non-terminal, a second is refused.
    assert!(matches!(
        server.create_transaction("abc", "tester", vec![]),
        Err(Error::Existing(_))
    ));
    // Other items are unaffected.
    server.create_transaction("unrelated", "tester", vec![])?;

    let rec = wait_terminal(&server, &tx)?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);
    server.create_transaction("abc", "tester", vec![])?;
    server.stop();
    Ok(())
}

#[test]
fn head_never_populates_the_cache() -> CResult<()> {
    let server = server()?;
    let up = stage(&server, b"cache me")?;
    let rec = commit(&server, "itm", vec![Command::Add(up)])?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    // HEAD reports a miss and starts nothing, no matter how often.
    assert!(matches!(server.blob_head("itm", 1)?, Content::Waiting));
    assert!(matches!(server.blob_head("itm", 1)?, Content::Waiting));

    // A GET populates; afterwards HEAD sees the cached copy.
    assert_eq!(read_content(server.blob_content("itm", 1)?)?, b"cache me");
    assert!(matches!(server.blob_head("itm", 1)?, Content::Cached { .. }));
    server.stop();
    Ok(())
}

#[test]
fn within_item_dedup_across_commits() -> CResult<()> {
    let server = server()?;

    // Two uploads with identical content and a recorded digest.
    let md5 = hex::decode("5eb63bbbe01eeed093cb22bb8f5acdc3").expect("hex");
    let first = stage(&server, b"hello world")?;
    server.upload(&first).expect("staged").set_md5(md5.clone())?;
    let second = stage(&server, b"hello world")?;
    server.upload(&second).expect("staged").set_md5(md5)?;

    let rec = commit(&server, "itm", vec![Command::Add(first)])?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);
    let rec = commit(&server, "itm", vec![Command::Add(second.clone())])?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    // The second add resolved to the existing blob.
    assert_eq!(rec.blob_map.get(&second), Some(&1));
    assert_eq!(server.item("itm")?.blobs.len(), 1);
    server.stop();
    Ok(())
}

#[test]
fn versions_and_slot_paths() -> CResult<()> {
    let server = server()?;

    let one = stage(&server, b"first draft")?;
    let rec = commit(
        &server,
        "doc",
        vec![
            Command::Add(one.clone()),
            Command::Slot("text".into(), one),
            Command::Note("v1".into()),
        ],
    )?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    let two = stage(&server, b"second draft")?;
    let rec = commit(
        &server,
        "doc",
        vec![Command::Add(two.clone()), Command::Slot("text".into(), two)],
    )?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    // The newest version answers the bare name; @1 pins the old version;
    // @blob addresses content directly.
    let (bid, content) = server.slot_content("doc", "text")?;
    assert_eq!(bid, 2);
    assert_eq!(read_content(content)?, b"second draft");

    let (bid, content) = server.slot_content("doc", "@1/text")?;
    assert_eq!(bid, 1);
    assert_eq!(read_content(content)?, b"first draft");

    let (bid, content) = server.slot_content("doc", "@blob/1")?;
    assert_eq!(bid, 1);
    assert_eq!(read_content(content)?, b"first draft");

    assert!(matches!(
        server.slot_content("doc", "missing"),
        Err(Error::NoSlot(_))
    ));
    server.stop();
    Ok(())
}

#[test]
fn transaction_bodies_decode_and_reject() -> CResult<()> {
    let server = server()?;
    let up = stage(&server, b"content")?;

    let body = format!(r#"[["add","{}"],["slot","a/b","{}"],["note","loaded"]]"#, up, up);
    let commands = commands_from_json(body.as_bytes())?;
    let rec = commit(&server, "itm", commands)?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);
    assert_eq!(server.item("itm")?.versions[0].note, "loaded");

    assert!(matches!(
        commands_from_json(br#"[["transmogrify","x"]]"#),
        Err(Error::Malformed(_))
    ));
    server.stop();
    Ok(())
}

#[test]
fn state_survives_restart() -> CResult<()> {
    let store: Arc<dyn Store> = Arc::new(Memory::new());
    {
        let server = server_over(store.clone(), Config::default())?;
        let up = stage(&server, b"durable")?;
        let rec = commit(&server, "itm", vec![Command::Add(up)])?;
        assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);
        server.stop();
    }

    // A fresh server over the same store sees the item, the uploads, and
    // the finished transaction.
    let server = server_over(store, Config::default())?;
    assert_eq!(server.items()?, vec!["itm".to_string()]);
    assert_eq!(read_content(server.blob_content("itm", 1)?)?, b"durable");
    assert_eq!(server.uploads().list()?.len(), 1);
    let txs = server.transactions()?;
    assert_eq!(txs.len(), 1);
    assert_eq!(server.transaction(&txs[0])?.map(|r| r.status), Some(TxStatus::Finished));
    server.stop();
    Ok(())
}

#[test]
fn fixity_round_trip() -> CResult<()> {
    let server = server()?;
    let up = stage(&server, b"verify me")?;
    let rec = commit(&server, "itm", vec![Command::Add(up)])?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    let id = server.schedule_fixity("itm")?;
    assert!(id > 0);
    let hits = server.fixity_db().search_fixity(None, None, Some("itm"), None)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].status, bendo::fixity::FixityStatus::Scheduled);
    server.stop();
    Ok(())
}

#[test]
fn bundle_listing() -> CResult<()> {
    let server = server()?;
    let up = stage(&server, b"content")?;
    let rec = commit(&server, "itm", vec![Command::Add(up)])?;
    assert_eq!(rec.status, TxStatus::Finished, "errors: {:?}", rec.errors);

    assert_eq!(server.bundles("")?, vec!["itm-0001".to_string()]);
    let reader = server.open_bundle("itm-0001")?;
    assert!(reader.files().contains(&"item-info.json".to_string()));

    server.set_tape(false);
    assert!(matches!(server.bundles(""), Err(Error::NoStore)));
    server.stop();
    Ok(())
}
