use std::sync::atomic::{AtomicUsize, Ordering};

macro_rules! metrics {
    (
        $internal_container:ident {
            $(
                $(#[$meta:meta])*
                $metric:ident: $ty:ident,
            )*
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

metrics!(InternalMetrics {
    /**
    A batch was taken off the queue and processed.
    */
    queue_batch_processed: Counter,
    /**
    Processing a batch panicked; its items were dropped.
    */
    queue_batch_panicked: Counter,
    /**
    An item was rejected because the queue was full.
    */
    queue_full_discarded: Counter,
    /**
    A sender blocked because the queue was full.
    */
    queue_full_blocked: Counter,
});
