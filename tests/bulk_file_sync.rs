//! Scenario A: a workstation announces a hash-only file change, gets told
//! the controller doesn't have the content yet, then resends with data.

use splash::cache::{content_hash, ObjectCache};
use splash::registry::Registry;
use splash::scheduler::Scheduler;
use splash::session::{self, ControllerContext};
use splash::workingcopy::WorkingCopy;
use splash_proto::{ClientType, FileChangeEntry, Message};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn spawn_controller() -> (TcpListener, Arc<ControllerContext>, TempDir) {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(ObjectCache::open_at(tmp.path().join("cache"), None).unwrap());
    let registry = Arc::new(Registry::new());
    let scheduler = Arc::new(Scheduler::new(registry.clone()));
    let working_copy = Arc::new(WorkingCopy::new(registry.clone()));
    let ctx = Arc::new(ControllerContext::new(cache, registry, scheduler, working_copy));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    (listener, ctx, tmp)
}

fn handshake(stream: &mut TcpStream) {
    splash_proto::write_message(
        stream,
        &Message::ClientHello {
            magic: splash_proto::PROTOCOL_MAGIC,
            version: splash_proto::PROTOCOL_VERSION,
            client_type: ClientType::Developer,
            hostname: "devbox".into(),
            uuid: None,
        },
    )
    .unwrap();
    match splash_proto::read_message(stream).unwrap() {
        Some(Message::ServerHello { .. }) => {}
        other => panic!("unexpected handshake reply: {:?}", other),
    }
}

#[test]
fn hash_only_change_is_nacked_then_acked_once_content_arrives() {
    let (listener, ctx, _tmp) = spawn_controller();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        session::handle_connection(&ctx, &mut stream).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    handshake(&mut client);

    let data = b"int main(){}";
    let hash = content_hash(data);

    // First announce just the hash -- controller has never seen this path.
    splash_proto::write_message(
        &mut client,
        &Message::BulkFileChanged {
            entries: vec![FileChangeEntry { fname: "src/main.c".into(), hash: hash.clone(), data: None }],
        },
    )
    .unwrap();
    match splash_proto::read_message(&mut client).unwrap() {
        Some(Message::BulkFileAck { entries }) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].fname, "src/main.c");
            assert!(!entries[0].have_content);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    // Resend with the actual bytes; the controller should now have it.
    splash_proto::write_message(
        &mut client,
        &Message::BulkFileChanged {
            entries: vec![FileChangeEntry { fname: "src/main.c".into(), hash, data: Some(data.to_vec()) }],
        },
    )
    .unwrap();
    match splash_proto::read_message(&mut client).unwrap() {
        Some(Message::BulkFileAck { entries }) => {
            assert!(entries[0].have_content);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    drop(client);
    server.join().unwrap();
}
