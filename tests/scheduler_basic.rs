//! End-to-end lifecycle behavior: scheduling, events, cancellation, results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobs_rs::{
    JobEvent, JobEventListener, JobId, JobSpec, JobState, JobStatus, JoinError, Priority,
    Progress, Scheduler, SchedulerConfig,
};

fn quick_scheduler() -> Scheduler {
    Scheduler::with_config(SchedulerConfig {
        worker_retirement: Duration::from_millis(200),
        ..SchedulerConfig::default()
    })
}

/// Records the order of lifecycle callbacks.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<&'static str>>,
}

impl Recorder {
    fn push(&self, what: &'static str) {
        self.seen.lock().unwrap().push(what);
    }

    fn snapshot(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().clone()
    }
}

impl JobEventListener for Recorder {
    fn scheduled(&self, _e: &JobEvent) {
        self.push("scheduled");
    }
    fn about_to_run(&self, _e: &JobEvent) {
        self.push("about_to_run");
    }
    fn running(&self, _e: &JobEvent) {
        self.push("running");
    }
    fn sleeping(&self, _e: &JobEvent) {
        self.push("sleeping");
    }
    fn awake(&self, _e: &JobEvent) {
        self.push("awake");
    }
    fn done(&self, _e: &JobEvent) {
        self.push("done");
    }
}

#[test]
fn lifecycle_events_fire_in_order() {
    let sched = quick_scheduler();
    let recorder = Arc::new(Recorder::default());
    let job = sched.create_job(JobSpec::new("observed", |_| JobStatus::Ok).priority(Priority::Interactive));
    sched.add_job_listener(job, Arc::clone(&recorder) as Arc<dyn JobEventListener>);

    sched.schedule(job);
    sched.join(job, None).unwrap();

    assert_eq!(
        recorder.snapshot(),
        vec!["scheduled", "about_to_run", "running", "done"]
    );
    sched.shutdown();
}

#[test]
fn sleep_and_wake_fire_their_events() {
    let sched = quick_scheduler();
    let recorder = Arc::new(Recorder::default());
    // A long explicit delay keeps the job in the sleep queue while we poke it.
    let job = sched.create_job(JobSpec::new("napper", |_| JobStatus::Ok));
    sched.add_job_listener(job, Arc::clone(&recorder) as Arc<dyn JobEventListener>);

    sched.schedule_after(job, Duration::from_secs(3600));
    assert_eq!(sched.state(job), JobState::Sleeping);
    sched.wake_up(job);
    sched.join(job, None).unwrap();

    let events = recorder.snapshot();
    assert_eq!(events.first(), Some(&"scheduled"));
    assert!(events.contains(&"awake"));
    assert_eq!(events.last(), Some(&"done"));
    sched.shutdown();
}

#[test]
fn cancel_of_queued_job_is_idempotent() {
    let sched = quick_scheduler();
    let runs = Arc::new(AtomicUsize::new(0));
    let recorder = Arc::new(Recorder::default());
    let counter = Arc::clone(&runs);
    let job = sched.create_job(JobSpec::new("doomed", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        JobStatus::Ok
    }));
    sched.add_job_listener(job, Arc::clone(&recorder) as Arc<dyn JobEventListener>);

    // Long priority delay keeps it waiting long enough to cancel.
    sched.schedule_after(job, Duration::from_secs(3600));
    assert!(sched.cancel(job));
    assert!(sched.cancel(job));
    assert!(sched.cancel(job));

    assert_eq!(sched.state(job), JobState::None);
    assert_eq!(sched.result(job), Some(JobStatus::Canceled));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let dones = recorder.snapshot().iter().filter(|e| **e == "done").count();
    assert_eq!(dones, 1, "repeat cancels must not re-fire done");
    sched.shutdown();
}

#[test]
fn cancel_of_running_job_is_cooperative() {
    let sched = quick_scheduler();
    let job = sched.create_job(
        JobSpec::new("poller", |progress: &Progress| {
            while !progress.is_canceled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            JobStatus::Canceled
        })
        .priority(Priority::Interactive),
    );
    sched.schedule(job);

    // Wait for it to actually start.
    while sched.state(job) != JobState::Running {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(!sched.cancel(job), "running job only gets flagged");
    sched.join(job, None).unwrap();
    assert_eq!(sched.result(job), Some(JobStatus::Canceled));
    sched.shutdown();
}

#[test]
fn panicking_body_reports_error_status() {
    let sched = quick_scheduler();
    let job = sched.create_job(
        JobSpec::new("explosive", |_: &Progress| -> JobStatus { panic!("kaboom") })
            .priority(Priority::Interactive),
    );
    sched.schedule(job);
    sched.join(job, None).unwrap();

    match sched.result(job) {
        Some(JobStatus::Error(message)) => assert!(message.contains("kaboom")),
        other => panic!("expected error status, got {other:?}"),
    }
    sched.shutdown();
}

/// A listener that cancels every job it sees at the veto point.
struct Veto {
    sched: Arc<Scheduler>,
}

impl JobEventListener for Veto {
    fn about_to_run(&self, event: &JobEvent) {
        self.sched.cancel(event.job);
    }
}

#[test]
fn about_to_run_listener_can_veto_the_body() {
    let sched = Arc::new(quick_scheduler());
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let job = sched.create_job(
        JobSpec::new("vetoed", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        })
        .priority(Priority::Interactive),
    );
    sched.add_job_listener(
        job,
        Arc::new(Veto {
            sched: Arc::clone(&sched),
        }),
    );

    sched.schedule(job);
    sched.join(job, None).unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0, "vetoed body must not run");
    assert_eq!(sched.result(job), Some(JobStatus::Canceled));
    sched.shutdown();
}

#[test]
fn finished_job_can_be_rescheduled() {
    let sched = quick_scheduler();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let job = sched.create_job(
        JobSpec::new("repeat", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        })
        .priority(Priority::Interactive),
    );

    for _ in 0..3 {
        sched.schedule(job);
        sched.join(job, None).unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    sched.shutdown();
}

#[test]
fn join_honors_cancellation() {
    let sched = quick_scheduler();
    let job = sched.create_job(JobSpec::new("eternal", |_| JobStatus::Ok));
    sched.schedule_after(job, Duration::from_secs(3600));

    let progress = Progress::new();
    let canceler = {
        let p = progress.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            p.set_canceled();
        })
    };
    assert_eq!(sched.join(job, Some(&progress)), Err(JoinError::Canceled));
    canceler.join().unwrap();
    sched.shutdown();
}

#[test]
fn join_family_waits_for_all_members() {
    let sched = Scheduler::with_config(SchedulerConfig {
        worker_retirement: Duration::from_millis(200),
        family_join_poll: Duration::from_millis(10),
        ..SchedulerConfig::default()
    });
    let finished = Arc::new(AtomicUsize::new(0));
    let family = "batch";
    let mut jobs = Vec::new();
    for i in 0..4 {
        let counter = Arc::clone(&finished);
        let job = sched.create_job(
            JobSpec::new(format!("member-{i}"), move |_| {
                std::thread::sleep(Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
                JobStatus::Ok
            })
            .priority(Priority::Interactive)
            .family(move |token| token.downcast_ref::<&str>() == Some(&family)),
        );
        jobs.push(job);
        sched.schedule(job);
    }

    let token: &dyn std::any::Any = &family;
    sched.join_family(Some(token), None).unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 4);
    for job in jobs {
        assert_eq!(sched.state(job), JobState::None);
    }
    sched.shutdown();
}

#[test]
fn family_operations_target_only_members() {
    let sched = quick_scheduler();
    let family = "team";
    let member = sched.create_job(
        JobSpec::new("member", |_| JobStatus::Ok)
            .family(move |token| token.downcast_ref::<&str>() == Some(&family)),
    );
    let outsider = sched.create_job(JobSpec::new("outsider", |_| JobStatus::Ok));

    sched.schedule_after(member, Duration::from_secs(3600));
    sched.schedule_after(outsider, Duration::from_secs(3600));

    let token: &dyn std::any::Any = &family;
    sched.cancel_family(token);
    assert_eq!(sched.state(member), JobState::None);
    assert_eq!(sched.state(outsider), JobState::Sleeping);

    assert!(sched.cancel(outsider));
    sched.shutdown();
}

#[test]
fn shutdown_cancels_queued_work() {
    let sched = quick_scheduler();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let job = sched.create_job(JobSpec::new("never", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        JobStatus::Ok
    }));
    sched.schedule_after(job, Duration::from_secs(3600));
    sched.shutdown();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(sched.result(job), Some(JobStatus::Canceled));
}

#[test]
fn job_id_equality_and_debug() {
    let sched = quick_scheduler();
    let a = sched.create_job(JobSpec::new("a", |_| JobStatus::Ok));
    let b = sched.create_job(JobSpec::new("b", |_| JobStatus::Ok));
    assert_ne!(a, b);
    let rendered = format!("{a:?}");
    assert!(rendered.starts_with("JobId("));
    let _: JobId = a;
    sched.shutdown();
}
