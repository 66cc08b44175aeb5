//! End-to-end supervisor scenarios
//!
//! Every test drives a real supervisor over real mapped tables in a temp
//! work directory; only the protocol workers are scripted.

use afd_fd::connection::MAX_LOOPS_BEFORE_RESTART;
use afd_fd::testing::{message, FakeWorkers, TestBed};
use afd_fd::{Event, FdError, Flow, PriorityRights, Supervisor, WorkerCommand, WorkerControl};
use afd_ipc::{
    set_cstr, BurstAck, ControlWord, DeleteRequest, FdCommand, HostRecord, RetrieveRecord,
    AUTO_PAUSE_QUEUE, AWAIT_BURST_ACK, ERROR_QUEUE_SET, FILES_IN_QUEUE, HOST_ONE, HOST_TWO,
    INTERRUPT_JOB, NONE, QUEUED_FOR_BURST, QUEUE_LIST_EMPTY,
};
use afd_config::testing::TestEnvironment;
use afd_fd::fsa::Fsa;
use nix::sys::signal::Signal;

const T0: i64 = 1000;
const JOB: u32 = 0x10;

fn alpha() -> HostRecord {
    let mut h = HostRecord::new("alpha", 1);
    h.retry_interval = 30;
    h
}

fn start(bed: TestBed) -> (TestEnvironment, Supervisor<FakeWorkers>) {
    let (env, sup) = bed.start(T0).unwrap();
    env.write_message(JOB, "ftp://user@alpha/out", &[]).unwrap();
    (env, sup)
}

fn queue_message(sup: &mut Supervisor<FakeWorkers>, unique: u32, now: i64) -> String {
    let msg = message(JOB, T0, unique, b'5');
    assert_eq!(
        sup.handle_event(Event::NewMessage(msg), now).unwrap(),
        Flow::Continue
    );
    msg.msg_name(false)
}

fn finish(sup: &mut Supervisor<FakeWorkers>, pid: i32, code: i32, now: i64) -> Flow {
    sup.workers_mut().exit(pid, code);
    sup.handle_event(Event::WorkerFinished(pid), now).unwrap()
}

#[test]
fn test_two_messages_start_two_workers() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    let first = queue_message(&mut sup, 1, T0);
    let second = queue_message(&mut sup, 2, T0);
    assert_eq!(sup.fsa().host(0).unwrap().jobs_queued, 2);

    sup.tick(T0).unwrap();

    let spawned = &sup.workers().spawned;
    assert_eq!(spawned.len(), 2);
    assert_eq!(spawned[0].1.program, "sf_ftp");
    assert_eq!(spawned[0].1.args[1], "0");
    assert_eq!(spawned[0].1.args[4], first);
    assert_eq!(spawned[1].1.args[1], "1");
    assert_eq!(spawned[1].1.args[4], second);

    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.active_transfers, 2);
    assert_eq!(host.jobs_queued, 0);
    assert_eq!(host.live_job_count(), 2);
    assert_eq!(sup.connections().active_count(), 2);
    assert!(sup.queue().entries().iter().all(|e| e.is_running()));

    let pids: Vec<i32> = sup.workers().spawned.iter().map(|(pid, _)| *pid).collect();
    for pid in pids {
        finish(&mut sup, pid, 0, T0 + 5);
    }
    assert!(sup.queue().is_empty());
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.active_transfers, 0);
    assert_eq!(host.live_job_count(), 0);
    assert_eq!(host.error_history[0], 0);
    assert_eq!(sup.mdb().records()[0].last_transfer_time, T0 + 5);
}

#[test]
fn test_connection_limit_keeps_jobs_pending() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()).config(|c| c.max_connections = 1));
    queue_message(&mut sup, 1, T0);
    queue_message(&mut sup, 2, T0);
    sup.tick(T0).unwrap();

    assert_eq!(sup.workers().spawned.len(), 1);
    assert!(sup.queue().entries()[1].is_pending());
    assert_eq!(sup.fsa().host(0).unwrap().jobs_queued, 1);

    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, T0 + 1);
    sup.tick(T0 + 1).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);
}

#[test]
fn test_burst_hands_job_to_idle_worker() {
    let mut host = alpha();
    host.keep_connected = 60;
    let (_env, mut sup) = start(TestBed::new().host(host));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    ControlWord::announce_ready(&mut sup.fsa_mut().host_mut(0).unwrap().job_status[0]);
    let second = queue_message(&mut sup, 2, T0 + 1);
    sup.tick(T0 + 1).unwrap();

    assert_eq!(sup.workers().spawned.len(), 1);
    assert!(sup.workers().signals.contains(&(pid, Signal::SIGUSR1)));
    assert_eq!(sup.queue().len(), 1);
    let entry = sup.queue().entries()[0];
    assert_eq!(entry.msg_name(), second);
    assert_eq!(entry.pid, pid);
    assert_ne!(entry.special_flag & QUEUED_FOR_BURST, 0);

    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.burst2_counter, 1);
    assert_eq!(host.jobs_queued, 0);
    assert_eq!(host.active_transfers, 1);
    assert_eq!(ControlWord::load(&host.job_status[0]), ControlWord::Busy);
    assert_eq!(sup.connections().live().next().unwrap().1.msg_name, second);
}

#[test]
fn test_burst_ack_releases_previous_job() {
    let mut host = alpha();
    host.keep_connected = 60;
    let (_env, mut sup) = start(TestBed::new().host(host).config(|c| c.burst_ack = true));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    ControlWord::announce_ready(&mut sup.fsa_mut().host_mut(0).unwrap().job_status[0]);
    queue_message(&mut sup, 2, T0 + 1);
    sup.tick(T0 + 1).unwrap();

    assert_eq!(sup.queue().len(), 2);
    assert_ne!(sup.queue().entries()[0].special_flag & AWAIT_BURST_ACK, 0);
    assert_eq!(sup.ack_queue().unwrap().len(), 1);

    let ack = BurstAck {
        job_id: JOB,
        creation_time: T0,
        unique_number: 1,
        ..Default::default()
    };
    sup.handle_event(Event::BurstAck(ack), T0 + 2).unwrap();
    assert_eq!(sup.queue().len(), 1);
    assert!(sup.ack_queue().unwrap().is_empty());
}

#[test]
fn test_connect_error_ages_and_holds_back_job() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let before = sup.queue().entries()[0].msg_number;
    let pid = sup.workers().last_pid().unwrap();

    finish(&mut sup, pid, 1, T0 + 10);

    let entry = sup.queue().entries()[0];
    assert!(entry.is_pending());
    assert_eq!(entry.retries, 1);
    assert_eq!(entry.msg_number, before + 200_000.0);
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.error_counter, 1);
    assert_eq!(host.first_error_time, T0 + 10);
    assert_eq!(host.error_history[0], 1);
    assert_eq!(host.active_transfers, 0);
    assert_eq!(host.jobs_queued, 1);
    assert_ne!(host.host_status & ERROR_QUEUE_SET, 0);
    assert!(sup.error_queue().contains(JOB));
    assert_eq!(sup.error_queue().entries()[0].next_retry_time, T0 + 40);

    // Still cooling down.
    sup.tick(T0 + 20).unwrap();
    assert_eq!(sup.workers().spawned.len(), 1);

    sup.tick(T0 + 40).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);
    let args = &sup.workers().spawned[1].1.args;
    assert!(args.windows(2).any(|w| w == ["-o", "1"]));

    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, T0 + 45);
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.error_counter, 0);
    assert_eq!(host.host_status & ERROR_QUEUE_SET, 0);
    assert!(!sup.error_queue().contains(JOB));
    assert!(sup
        .sinks()
        .event
        .lines()
        .iter()
        .any(|l| l.ends_with("alpha|ERROR_ACTION stop")));
}

#[test]
fn test_retry_request_skips_cooldown() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 1, T0 + 1);

    sup.handle_event(Event::Retry(0), T0 + 2).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);
    assert!(sup.queue().entries()[0].is_running());
}

#[test]
fn test_remote_dir_check_queues_and_starts_fetch() {
    let dir = RetrieveRecord::new("in", "alpha", 0x2a, 0);
    let (_env, mut sup) = start(
        TestBed::new()
            .host(alpha())
            .dir(dir)
            .config(|c| c.remote_file_check_interval = 120),
    );

    sup.check_remote_dirs(T0).unwrap();
    assert_eq!(sup.queue().len(), 1);
    let entry = sup.queue().entries()[0];
    assert!(entry.is_fetch());
    assert_eq!(entry.msg_name(), "2a");
    assert_eq!(sup.fra().dir(0).unwrap().queued, 1);
    assert_eq!(sup.fra().dir(0).unwrap().next_check_time, T0 + 120);
    let (pid, cmd) = sup.workers().spawned[0].clone();
    assert_eq!(cmd.program, "gf_ftp");
    assert_eq!(cmd.args[4], "2a");

    // Already queued.
    sup.check_remote_dirs(T0 + 1).unwrap();
    assert_eq!(sup.queue().len(), 1);

    finish(&mut sup, pid, 0, T0 + 5);
    assert!(sup.queue().is_empty());
    assert_eq!(sup.fra().dir(0).unwrap().queued, 0);

    sup.tick(T0 + 80).unwrap();
    assert_eq!(sup.workers().spawned.len(), 1);
    sup.tick(T0 + 200).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);
}

#[test]
fn test_age_limit_deletes_job_files() {
    let (env, mut sup) = start(TestBed::new().host(alpha()));
    env.write_message(JOB, "ftp://user@alpha/out", &["age-limit 60"]).unwrap();
    let name = queue_message(&mut sup, 1, T0);
    env.create_job_dir(&name, 2).unwrap();

    sup.tick(T0 + 100).unwrap();

    assert!(sup.queue().is_empty());
    assert!(sup.workers().spawned.is_empty());
    assert_eq!(sup.fsa().host(0).unwrap().jobs_queued, 0);
    assert!(!env.paths.job_dir(&name).exists());
    let lines = sup.sinks().delete.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().all(|l| l.contains("|alpha|AGE_OUTPUT|")));
}

#[test]
fn test_unknown_job_id_deletes_files() {
    let (env, mut sup) = start(TestBed::new().host(alpha()));
    let msg = message(0x99, T0, 1, b'5');
    env.create_job_dir(&msg.msg_name(false), 1).unwrap();
    sup.handle_event(Event::NewMessage(msg), T0).unwrap();

    assert!(sup.queue().is_empty());
    let lines = sup.sinks().delete.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("|JID_LOOKUP_FAILED|"));
}

#[test]
fn test_message_for_unknown_host_is_dropped() {
    let (env, mut sup) = start(TestBed::new().host(alpha()));
    env.write_message(0x20, "ftp://ghost/out", &[]).unwrap();
    sup.handle_event(Event::NewMessage(message(0x20, T0, 1, b'5')), T0)
        .unwrap();
    assert!(sup.queue().is_empty());
    assert!(sup.sinks().delete.lines()[0].contains("|HOST_NOT_IN_FSA|"));
}

#[test]
fn test_delete_all_jobs_of_host() {
    let mut host = alpha();
    host.allowed_transfers = 1;
    let (_env, mut sup) = start(TestBed::new().host(host));
    queue_message(&mut sup, 1, T0);
    queue_message(&mut sup, 2, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    let req = DeleteRequest::AllJobsFromHost("alpha".into());
    sup.handle_event(Event::Delete(req), T0 + 1).unwrap();

    assert!(sup.queue().is_empty());
    assert!(sup.workers().signals.contains(&(pid, Signal::SIGKILL)));
    assert_eq!(sup.fsa().host(0).unwrap().jobs_queued, 0);
    assert_eq!(sup.sinks().delete.lines().len(), 2);

    sup.handle_event(Event::WorkerFinished(pid), T0 + 2).unwrap();
    assert_eq!(sup.connections().active_count(), 0);
    assert_eq!(sup.fsa().host(0).unwrap().active_transfers, 0);
}

#[test]
fn test_save_stop_waits_for_workers() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    queue_message(&mut sup, 2, T0);
    sup.tick(T0).unwrap();

    let flow = sup
        .handle_event(Event::Command(FdCommand::SaveStop), T0 + 1)
        .unwrap();
    assert_eq!(flow, Flow::Continue);
    assert!(sup.is_stopping());
    assert!(sup.workers().signals.is_empty());

    queue_message(&mut sup, 3, T0 + 1);
    sup.tick(T0 + 2).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);

    let pids: Vec<i32> = sup.workers().spawned.iter().map(|(pid, _)| *pid).collect();
    assert_eq!(finish(&mut sup, pids[0], 0, T0 + 3), Flow::Continue);
    assert_eq!(finish(&mut sup, pids[1], 0, T0 + 4), Flow::Exit);
    assert_eq!(sup.queue().len(), 1);
}

#[test]
fn test_stop_interrupts_and_requeues() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    sup.handle_event(Event::Signal(afd_fd::StopMode::Stop), T0 + 1)
        .unwrap();
    assert!(sup.workers().signals.contains(&(pid, Signal::SIGINT)));

    let flow = sup.handle_event(Event::WorkerFinished(pid), T0 + 1).unwrap();
    assert_eq!(flow, Flow::Exit);
    assert!(sup.queue().entries()[0].is_pending());
    assert_eq!(sup.fsa().host(0).unwrap().error_counter, 0);
}

#[test]
fn test_save_stop_kills_after_timeout() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    sup.handle_event(Event::Command(FdCommand::SaveStop), T0).unwrap();
    let deadline = T0 + afd_fd::supervisor::FD_TIMEOUT;
    assert_eq!(sup.tick(deadline).unwrap(), Flow::Continue);
    assert!(sup.workers().signals.contains(&(pid, Signal::SIGKILL)));

    let flow = sup.handle_event(Event::WorkerFinished(pid), deadline).unwrap();
    assert_eq!(flow, Flow::Exit);
}

#[test]
fn test_queue_dump_handshake() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    assert_eq!(sup.poll_timeout(T0).as_secs(), 35);

    sup.handle_event(Event::Command(FdCommand::FlushMsgFifoDumpQueue), T0)
        .unwrap();
    assert_eq!(sup.sinks().queue_list_ready.raw(), [vec![QUEUE_LIST_EMPTY]]);
    assert_eq!(sup.poll_timeout(T0).as_secs(), 1);

    sup.handle_event(Event::QueueListDone, T0).unwrap();
    assert_eq!(sup.poll_timeout(T0).as_secs(), 35);
}

#[test]
fn test_fsa_rebuild_moves_host() {
    let (env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    Fsa::create(&env.paths, 2, &[HostRecord::new("beta", 2), alpha()]).unwrap();
    sup.handle_event(Event::Command(FdCommand::FsaAboutToChange), T0 + 1)
        .unwrap();

    assert_eq!(sup.fsa().id(), 2);
    assert_eq!(sup.mdb().records()[0].fsa_pos, 1);
    assert_eq!(sup.connections().live().next().unwrap().1.fsa_pos, 1);
    assert_eq!(sup.fsa().host(1).unwrap().active_transfers, 1);

    finish(&mut sup, pid, 0, T0 + 2);
    assert!(sup.queue().is_empty());
    assert_eq!(sup.fsa().host(1).unwrap().active_transfers, 0);
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn toggling_host() -> HostRecord {
    let mut h = alpha();
    h.auto_toggle = 1;
    h.max_successful_retries = 2;
    set_cstr(&mut h.real_hostname[0], "alpha-a");
    set_cstr(&mut h.real_hostname[1], "alpha-b");
    h
}

#[test]
fn test_syntax_error_does_not_charge_host() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    finish(&mut sup, pid, 61, T0 + 1);

    let entry = sup.queue().entries()[0];
    assert!(entry.is_pending());
    assert_eq!(entry.retries, 0);
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.error_counter, 0);
    assert_eq!(host.first_error_time, 0);
    assert_eq!(host.host_status & ERROR_QUEUE_SET, 0);
    assert!(!sup.error_queue().contains(JOB));

    sup.tick(T0 + 2).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);
}

#[test]
fn test_stale_job_is_purged_on_syntax_error() {
    let (env, mut sup) = start(
        TestBed::new()
            .host(alpha())
            .config(|c| c.delete_stale_error_jobs = true),
    );
    let name = queue_message(&mut sup, 1, T0);
    env.create_job_dir(&name, 1).unwrap();
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    // The sweep notices the job definition is gone.
    std::fs::remove_file(env.paths.message_file(JOB)).unwrap();
    sup.tick(T0 + 35).unwrap();

    finish(&mut sup, pid, 61, T0 + 36);
    assert!(sup.queue().is_empty());
    assert!(!env.paths.job_dir(&name).exists());
    let lines = sup.sinks().delete.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("|alpha|STALE_ERROR_JOB|"));
    assert_eq!(sup.fsa().host(0).unwrap().error_counter, 0);
}

#[test]
fn test_error_limit_toggles_host_without_counting_retries() {
    let mut host = toggling_host();
    host.max_errors = 2;
    let (_env, mut sup) = start(TestBed::new().host(host));
    queue_message(&mut sup, 1, T0);

    let mut now = T0;
    for attempt in 0..4 {
        sup.tick(now).unwrap();
        assert_eq!(sup.workers().spawned.len(), attempt + 1);
        assert_eq!(sup.fsa().host(0).unwrap().successful_retries, 0);
        if attempt == 3 {
            break;
        }
        let pid = sup.workers().last_pid().unwrap();
        finish(&mut sup, pid, 1, now + 1);
        now += 32;
    }
    assert!(sup
        .workers()
        .spawned
        .iter()
        .all(|(_, cmd)| !has_flag(&cmd.args, "-t")));

    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.error_counter, 3);
    assert_eq!(host.host_toggle, HOST_TWO);
    assert_eq!(host.original_toggle_pos, HOST_ONE);
    let events = sup.sinks().event.lines();
    assert_eq!(
        events.iter().filter(|l| l.ends_with("alpha|ERROR_ACTION start")).count(),
        1
    );
    assert!(sup.sinks().transfer.lines()[0].ends_with("alpha|Automatic toggle to alpha-b"));

    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, now + 1);
    assert_eq!(sup.fsa().host(0).unwrap().error_counter, 0);
    assert!(sup
        .sinks()
        .event
        .lines()
        .iter()
        .any(|l| l.ends_with("alpha|ERROR_ACTION stop")));
}

#[test]
fn test_temp_toggle_tries_original_host() {
    let mut host = toggling_host();
    host.host_toggle = HOST_TWO;
    host.original_toggle_pos = HOST_ONE;
    let (_env, mut sup) = start(TestBed::new().host(host));

    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    assert!(!has_flag(&sup.workers().spawned[0].1.args, "-t"));
    assert_eq!(sup.fsa().host(0).unwrap().successful_retries, 1);
    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, T0 + 1);

    // Second success in a row tries the original host again.
    queue_message(&mut sup, 2, T0 + 2);
    sup.tick(T0 + 2).unwrap();
    assert!(has_flag(&sup.workers().spawned[1].1.args, "-t"));
    assert_eq!(sup.fsa().host(0).unwrap().successful_retries, 0);

    // A failed temp-toggle attempt requeues without charging the host.
    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 1, T0 + 3);
    let entry = sup.queue().entries()[0];
    assert!(entry.is_pending());
    assert_eq!(entry.retries, 0);
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.error_counter, 0);
    assert_eq!(host.host_toggle, HOST_TWO);
    assert!(!sup.error_queue().contains(JOB));

    sup.tick(T0 + 4).unwrap();
    assert!(!has_flag(&sup.workers().spawned[2].1.args, "-t"));
    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, T0 + 5);

    queue_message(&mut sup, 3, T0 + 6);
    sup.tick(T0 + 6).unwrap();
    assert!(has_flag(&sup.workers().spawned[3].1.args, "-t"));
    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, T0 + 7);

    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.host_toggle, HOST_ONE);
    assert_eq!(host.original_toggle_pos, NONE);
    assert!(sup
        .sinks()
        .transfer
        .lines()
        .iter()
        .any(|l| l.ends_with("alpha|Switching back to original host alpha-a")));
}

#[test]
fn test_burst_request_without_work_gets_no_more() {
    let mut host = alpha();
    host.keep_connected = 60;
    let (_env, mut sup) = start(TestBed::new().host(host));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();

    ControlWord::announce_ready(&mut sup.fsa_mut().host_mut(0).unwrap().job_status[0]);
    sup.handle_event(Event::WorkerFinished(-pid), T0 + 1).unwrap();

    assert!(sup.workers().signals.contains(&(pid, Signal::SIGUSR1)));
    let js = &sup.fsa().host(0).unwrap().job_status[0];
    assert_eq!(ControlWord::load(js), ControlWord::Busy);
    assert_eq!(js.unique_name[0], 0);
    assert_eq!(js.proc_id, pid);
    assert_eq!(sup.queue().len(), 1);
    assert_eq!(sup.connections().active_count(), 1);
}

#[test]
fn test_burst_request_takes_waiting_job() {
    let mut host = alpha();
    host.keep_connected = 60;
    host.allowed_transfers = 1;
    let (_env, mut sup) = start(TestBed::new().host(host));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();
    let second = queue_message(&mut sup, 2, T0 + 1);
    sup.tick(T0 + 1).unwrap();
    assert_eq!(sup.workers().spawned.len(), 1);

    ControlWord::announce_ready(&mut sup.fsa_mut().host_mut(0).unwrap().job_status[0]);
    sup.handle_event(Event::WorkerFinished(-pid), T0 + 2).unwrap();

    assert_eq!(sup.workers().spawned.len(), 1);
    assert!(sup.workers().signals.contains(&(pid, Signal::SIGUSR1)));
    assert_eq!(sup.queue().len(), 1);
    let entry = sup.queue().entries()[0];
    assert_eq!(entry.msg_name(), second);
    assert_eq!(entry.pid, pid);
    assert_ne!(entry.special_flag & QUEUED_FOR_BURST, 0);
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.burst2_counter, 1);
    assert_eq!(host.jobs_queued, 0);
    assert_eq!(ControlWord::load(&host.job_status[0]), ControlWord::Busy);
}

#[test]
fn test_helper_request_starts_second_fetch() {
    let dir = RetrieveRecord::new("in", "alpha", 0x2a, 0);
    let (_env, mut sup) = start(TestBed::new().host(alpha()).dir(dir));
    sup.check_remote_dirs(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();
    assert!(!has_flag(&sup.workers().spawned[0].1.args, "-d"));

    ControlWord::announce_helper_request(&mut sup.fsa_mut().host_mut(0).unwrap().job_status[0]);
    sup.handle_event(Event::WorkerFinished(-pid), T0 + 1).unwrap();

    let spawned = &sup.workers().spawned;
    assert_eq!(spawned.len(), 2);
    assert_eq!(spawned[1].1.program, "gf_ftp");
    assert_eq!(spawned[1].1.args[1], "1");
    assert!(has_flag(&spawned[1].1.args, "-d"));
    assert_eq!(sup.queue().len(), 2);
    assert!(sup.queue().entries().iter().any(|e| e.is_helper()));
    assert_eq!(sup.fra().dir(0).unwrap().queued, 2);
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(ControlWord::load(&host.job_status[0]), ControlWord::Busy);
    assert_eq!(host.active_transfers, 2);
}

#[test]
fn test_idle_worker_of_other_protocol_is_terminated() {
    let mut host = alpha();
    host.keep_connected = 60;
    host.allowed_transfers = 1;
    let (env, mut sup) = start(TestBed::new().host(host));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();
    ControlWord::announce_ready(&mut sup.fsa_mut().host_mut(0).unwrap().job_status[0]);

    env.write_message(0x11, "sftp://alpha/out", &[]).unwrap();
    sup.handle_event(Event::NewMessage(message(0x11, T0, 2, b'5')), T0 + 1)
        .unwrap();
    sup.tick(T0 + 1).unwrap();

    assert_eq!(sup.workers().spawned.len(), 1);
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(ControlWord::load(&host.job_status[0]), ControlWord::Terminating);
    assert_eq!(host.burst2_counter, 0);
    assert_eq!(sup.queue().entries().iter().filter(|e| e.is_pending()).count(), 1);

    finish(&mut sup, pid, 0, T0 + 2);
    sup.tick(T0 + 3).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);
    assert_eq!(sup.workers().spawned[1].1.program, "sf_sftp");
}

#[test]
fn test_no_files_to_send_clears_auto_pause() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()));
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    let pid = sup.workers().last_pid().unwrap();
    sup.fsa_mut().host_mut(0).unwrap().host_status |= AUTO_PAUSE_QUEUE;

    finish(&mut sup, pid, 62, T0 + 1);

    assert!(sup.queue().is_empty());
    let host = sup.fsa().host(0).unwrap();
    assert_eq!(host.host_status & AUTO_PAUSE_QUEUE, 0);
    assert_eq!(host.error_counter, 0);
    assert!(sup
        .sinks()
        .event
        .lines()
        .iter()
        .any(|l| l.ends_with("alpha|AUTO_PAUSE_QUEUE stop")));
}

#[test]
fn test_urgent_job_interrupts_running_one() {
    let mut host = alpha();
    host.allowed_transfers = 1;
    let (_env, mut sup) = start(TestBed::new().host(host).config(|c| c.interrupt_jobs = true));
    sup.handle_event(Event::NewMessage(message(JOB, T0, 1, b'9')), T0)
        .unwrap();
    sup.tick(T0).unwrap();
    sup.handle_event(Event::NewMessage(message(JOB, T0, 2, b'1')), T0 + 1)
        .unwrap();
    sup.tick(T0 + 1).unwrap();
    assert_eq!(sup.workers().spawned.len(), 1);
    assert_eq!(
        sup.fsa().host(0).unwrap().job_status[0].special_flag & INTERRUPT_JOB,
        0
    );

    sup.tick(T0 + 35).unwrap();
    assert_ne!(
        sup.fsa().host(0).unwrap().job_status[0].special_flag & INTERRUPT_JOB,
        0
    );
}

#[test]
fn test_fra_queued_counter_is_reconciled() {
    let dir = RetrieveRecord::new("in", "alpha", 0x2a, 0);
    let (_env, mut sup) = start(TestBed::new().host(alpha()).dir(dir));
    sup.check_remote_dirs(T0).unwrap();
    sup.fra_mut().dir_mut(0).unwrap().queued = 4;

    sup.tick(T0 + 800).unwrap();

    let dir = sup.fra().dir(0).unwrap();
    assert_eq!(dir.queued, 1);
    assert_ne!(dir.dir_flag & FILES_IN_QUEUE, 0);
    assert_eq!(sup.workers().spawned.len(), 1);
}

#[test]
fn test_unacknowledged_burst_goes_back_to_pending() {
    let mut host = alpha();
    host.keep_connected = 60;
    let (_env, mut sup) = start(TestBed::new().host(host).config(|c| c.burst_ack = true));
    let first = queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    ControlWord::announce_ready(&mut sup.fsa_mut().host_mut(0).unwrap().job_status[0]);
    queue_message(&mut sup, 2, T0 + 1);
    sup.tick(T0 + 1).unwrap();
    assert_eq!(sup.ack_queue().unwrap().len(), 1);

    // Not yet past the timeout at the first ack check.
    sup.tick(T0 + 80).unwrap();
    assert_eq!(sup.ack_queue().unwrap().len(), 1);

    sup.tick(T0 + 200).unwrap();
    assert!(sup.ack_queue().unwrap().is_empty());
    assert_eq!(sup.workers().spawned.len(), 2);
    let entry = sup
        .queue()
        .entries()
        .iter()
        .find(|e| e.msg_name() == first)
        .copied()
        .unwrap();
    assert_eq!(entry.special_flag & AWAIT_BURST_ACK, 0);
    assert_eq!(entry.pid, sup.workers().last_pid().unwrap());
}

#[test]
fn test_connection_limit_note_is_logged_once() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()).config(|c| c.max_connections = 1));
    queue_message(&mut sup, 1, T0);
    queue_message(&mut sup, 2, T0);
    assert!(!sup.connections().full_noted());

    sup.tick(T0).unwrap();
    assert!(sup.connections().full_noted());
    sup.tick(T0 + 1).unwrap();
    assert!(sup.connections().full_noted());

    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, T0 + 2);
    assert!(!sup.connections().full_noted());
    sup.tick(T0 + 2).unwrap();
    assert_eq!(sup.workers().spawned.len(), 2);
    assert!(!sup.connections().full_noted());
}

#[test]
fn test_slot_held_by_foreign_process_forces_restart() {
    let mut host = alpha();
    host.allowed_transfers = 1;
    let (_env, mut sup) = start(TestBed::new().host(host));
    let foreign = sup
        .workers_mut()
        .spawn(&WorkerCommand {
            program: "foreign".into(),
            args: vec![],
            nice: None,
            elevate: false,
        })
        .unwrap();
    sup.fsa_mut().host_mut(0).unwrap().job_status[0].proc_id = foreign;
    queue_message(&mut sup, 1, T0);

    let limit = i64::from(MAX_LOOPS_BEFORE_RESTART);
    for i in 0..limit - 1 {
        assert_eq!(sup.tick(T0 + i).unwrap(), Flow::Continue);
    }
    let err = sup.tick(T0 + limit - 1).unwrap_err();
    assert!(matches!(err, FdError::NeedsRestart(_)));
    assert_eq!(err.exit_code(), 5);
    assert_eq!(sup.workers().spawned.len(), 1);
}

#[test]
fn test_repeated_duplicate_fetch_forces_restart() {
    let dir = RetrieveRecord::new("in", "alpha", 0x2a, 0);
    let (_env, mut sup) = start(TestBed::new().host(alpha()).dir(dir));
    sup.check_remote_dirs(T0).unwrap();

    let limit = i64::from(MAX_LOOPS_BEFORE_RESTART);
    let rearm = |sup: &mut Supervisor<FakeWorkers>| {
        let d = sup.fra_mut().dir_mut(0).unwrap();
        d.queued = 0;
        d.next_check_time = 0;
    };
    for i in 1..limit {
        rearm(&mut sup);
        sup.check_remote_dirs(T0 + i).unwrap();
        assert_eq!(sup.queue().len(), 1);
    }
    rearm(&mut sup);
    let err = sup.check_remote_dirs(T0 + limit).unwrap_err();
    assert!(matches!(err, FdError::NeedsRestart(_)));
    assert_eq!(err.exit_code(), 5);
    assert_eq!(sup.workers().spawned.len(), 1);
}

#[test]
fn test_nice_values_follow_priority_rights() {
    let (_env, mut sup) = start(TestBed::new().host(alpha()).config(|c| {
        c.add_afd_priority = true;
        c.min_nice_value = 0;
        c.max_nice_value = 9;
    }));

    sup.set_priority_rights(PriorityRights::None);
    queue_message(&mut sup, 1, T0);
    sup.tick(T0).unwrap();
    assert_eq!(sup.workers().spawned[0].1.nice, None);

    sup.set_priority_rights(PriorityRights::Root);
    queue_message(&mut sup, 2, T0);
    sup.tick(T0).unwrap();
    let cmd = &sup.workers().spawned[1].1;
    assert_eq!(cmd.nice, Some(5));
    assert!(!cmd.elevate);

    let pid = sup.workers().last_pid().unwrap();
    finish(&mut sup, pid, 0, T0 + 1);
    sup.set_priority_rights(PriorityRights::Elevate);
    queue_message(&mut sup, 3, T0 + 1);
    sup.tick(T0 + 1).unwrap();
    let cmd = &sup.workers().spawned[2].1;
    assert_eq!(cmd.nice, Some(5));
    assert!(cmd.elevate);
}
