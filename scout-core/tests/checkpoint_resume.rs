use tempfile::TempDir;

use scout_core::config::{CrawlSection, QueuePolicy};
use scout_core::queue::{JobPriority, QueueManager, ScrapeJob};

fn section() -> CrawlSection {
    CrawlSection {
        start_url: "https://x.com/app".to_string(),
        ..CrawlSection::default()
    }
}

#[test]
fn resume_preserves_priorities_and_visited_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("x.com.json");

    let mut queue = QueueManager::new(&section()).unwrap();
    let mut urgent = ScrapeJob::seed("https://x.com/app/settings");
    urgent.priority = JobPriority::High;
    urgent.depth = 2;
    queue.add_jobs(vec![
        ScrapeJob::seed("https://x.com/app/reports"),
        urgent,
    ]);
    queue.mark_visited("https://x.com/app");
    queue.save_checkpoint(&path).unwrap();

    let mut resumed = QueueManager::new(&section()).unwrap();
    assert!(resumed.load_from_checkpoint(&path).unwrap());
    assert!(resumed.is_visited("https://x.com/app"));
    // High priority still wins after the round trip.
    let first = resumed.next_job().unwrap();
    assert_eq!(first.url, "https://x.com/app/settings");
    assert_eq!(first.priority, JobPriority::High);
}

#[test]
fn fifo_policy_survives_checkpoint_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("x.com.json");

    let fifo = CrawlSection {
        queue_policy: QueuePolicy::ScopedFifo,
        ..section()
    };
    let mut queue = QueueManager::new(&fifo).unwrap();
    let mut high = ScrapeJob::seed("https://x.com/app/second");
    high.priority = JobPriority::High;
    queue.add_jobs(vec![ScrapeJob::seed("https://x.com/app/first"), high]);
    queue.save_checkpoint(&path).unwrap();

    let mut resumed = QueueManager::new(&fifo).unwrap();
    resumed.load_from_checkpoint(&path).unwrap();
    // FIFO ignores priority: insertion order rules.
    assert_eq!(resumed.next_job().unwrap().url, "https://x.com/app/first");
    assert_eq!(resumed.next_job().unwrap().url, "https://x.com/app/second");
}

#[test]
fn clean_completion_removes_the_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("x.com.json");

    let queue = {
        let mut queue = QueueManager::new(&section()).unwrap();
        queue.mark_visited("https://x.com/app");
        queue.save_checkpoint(&path).unwrap();
        queue
    };
    assert!(path.exists());
    queue.delete_checkpoint(&path).unwrap();
    assert!(!path.exists());
    // Deleting an already-absent checkpoint stays quiet.
    queue.delete_checkpoint(&path).unwrap();
}

#[test]
fn unhealthy_pages_are_recrawled_after_resume() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("x.com.json");

    let mut queue = QueueManager::new(&section()).unwrap();
    queue.mark_visited("https://x.com/app/good");
    queue.mark_visited("https://x.com/app/broken");
    queue.save_checkpoint(&path).unwrap();

    let mut resumed = QueueManager::new(&section()).unwrap();
    resumed.load_from_checkpoint(&path).unwrap();
    let kept = resumed.load_healthy_visited_urls(|url| !url.contains("broken"));
    assert_eq!(kept, 1);

    // The released URL can be queued again; the healthy one cannot.
    let added = resumed.add_jobs(vec![
        ScrapeJob::seed("https://x.com/app/broken"),
        ScrapeJob::seed("https://x.com/app/good"),
    ]);
    assert_eq!(added, 1);
}
