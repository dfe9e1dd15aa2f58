/*!
A simple integration test of writing events to archived files from many threads.
*/

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use filesink::{Level, LogEvent, OverflowPolicy, PathRouter, Target};

fn main() {
    if std::path::Path::new("./logs").exists() {
        std::fs::remove_dir_all("./logs").unwrap();
    }

    // Diagnostics produced by filesink itself go to the terminal
    let _ = emit::setup().emit_to(emit_term::stdout()).init_internal();

    let mut reporter = emit::metric::Reporter::new();

    let files = filesink::target(PathRouter::from_fn(|evt| {
        format!("./logs/{}.log", evt.level())
    }))
    .archive_above_size_bytes(64 * 1024)
    .archive_file_name("./logs/archive/{####}.log")
    .build();

    reporter.add_source(files.metric_source());

    let target = filesink::background(files)
        .overflow(OverflowPolicy::Block)
        .spawn()
        .unwrap();

    reporter.add_source(target.metric_source());

    let target = Arc::new(target);
    let written = Arc::new(AtomicUsize::new(0));

    let expected_count = 10_000;
    let producers = 4;

    // Write our events
    let handles = (0..producers)
        .map(|producer| {
            let target = target.clone();
            let written = written.clone();

            thread::spawn(move || {
                for i in 0..expected_count / producers {
                    let level = if i % 10 == 0 { Level::Warn } else { Level::Info };

                    let written = written.clone();

                    target.write(
                        LogEvent::new(level, "integration", format!("Event #{i} from {producer}")),
                        filesink::callback(move |result| {
                            result.unwrap();
                            written.fetch_add(1, Ordering::Relaxed);
                        }),
                    );
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    // Wait for writing to complete
    assert!(target.blocking_flush(Duration::from_secs(10)));

    reporter.emit_metrics(emit_term::stdout());

    assert_eq!(expected_count, written.load(Ordering::Relaxed));

    // Ensure all events were written, across live files and archives
    let mut read_count = 0;
    for dir in ["./logs", "./logs/archive"] {
        for f in std::fs::read_dir(dir).unwrap() {
            let f = f.unwrap();

            if !f.metadata().unwrap().is_file() {
                continue;
            }

            let contents = std::fs::read_to_string(f.path()).unwrap();

            for line in contents.lines() {
                // Ensure the line is valid JSON
                let _: serde_json::Value = serde_json::from_str(line).unwrap();
                read_count += 1;
            }
        }
    }

    assert_eq!(expected_count, read_count, "unexpected total event count");
}
