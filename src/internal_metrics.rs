use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

macro_rules! metrics {
    (
        $pub_container:ty {
            $field:ident: $internal_container:ident {
                $(
                    $(#[$meta:meta])*
                    $metric:ident: $ty:ident -> $pub_ty:ident,
                )*
            }
        }
    ) => {
        #[derive(Default)]
        pub(crate) struct $internal_container {
            $(
                $(#[$meta])*
                pub(crate) $metric: $ty,
            )*
        }

        impl $internal_container {
            pub fn sample(&self) -> impl Iterator<Item = emit::metric::Metric<'static, emit::empty::Empty>> + 'static {
                let $internal_container { $($metric),* } = self;

                [$(
                    emit::metric::Metric::new(
                        emit::pkg!(),
                        stringify!($metric),
                        <$ty>::AGG,
                        emit::empty::Empty,
                        $metric.sample(),
                        emit::empty::Empty,
                    ),
                )*]
                .into_iter()
            }
        }

        impl $pub_container {
            $(
                $(#[$meta])*
                pub fn $metric(&self) -> $pub_ty {
                    self.$field.$metric.sample()
                }
            )*
        }
    };
}

#[derive(Default)]
pub(crate) struct Counter(AtomicUsize);

impl Counter {
    const AGG: &'static str = emit::well_known::METRIC_AGG_COUNT;

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

metrics!(
    FileTargetMetrics {
        metrics: InternalMetrics {
            /**
            A file was opened for appending.
            */
            file_open: Counter -> usize,
            /**
            Attempting to open a file failed.

            This includes paths that resolve to an existing directory.
            */
            file_open_failed: Counter -> usize,
            /**
            Attempting to write to or flush a file failed.
            */
            file_write_failed: Counter -> usize,
            /**
            A file left over from a previous run was deleted before it was first opened.
            */
            file_delete_on_startup: Counter -> usize,
            /**
            An open file was closed because it went idle or the open file cache was full.
            */
            file_evicted: Counter -> usize,
            /**
            A full file was moved into an archive.
            */
            archive_created: Counter -> usize,
            /**
            Attempting to move a full file into an archive failed.

            The file is left in place and rotation is retried on the next write.
            */
            archive_failed: Counter -> usize,
            /**
            An old archive was deleted to stay within the retention limit.
            */
            archive_deleted: Counter -> usize,
            /**
            Attempting to delete an old archive failed.
            */
            archive_delete_failed: Counter -> usize,
            /**
            Attempting to render an event failed and it was discarded.

            This happens before the event is written to any files.
            */
            event_format_failed: Counter -> usize,
            /**
            An event callback panicked.

            The event's outcome was still delivered and later callbacks in the batch were still invoked.
            */
            callback_panicked: Counter -> usize,
            /**
            Attempting to configure the target failed.
            */
            configuration_failed: Counter -> usize,
        }
    }
);

/**
Metrics produced by a [`crate::FileTarget`].

You can enumerate the metrics using the [`emit::metric::Source`] implementation. See [`emit::metric`] for details.
*/
pub struct FileTargetMetrics {
    pub(crate) metrics: Arc<InternalMetrics>,
}

impl emit::metric::Source for FileTargetMetrics {
    fn sample_metrics<S: emit::metric::sampler::Sampler>(&self, sampler: S) {
        for metric in self.metrics.sample() {
            sampler.metric(metric);
        }
    }
}
