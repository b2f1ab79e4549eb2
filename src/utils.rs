/// Evaluates an expression and logs how long it took at debug level.
macro_rules! timed {
    ($expr:expr, $label:expr) => {{
        let start = std::time::Instant::now();
        let result = $expr;
        log::debug!("{} took {:?}", $label, start.elapsed());
        result
    }};
}

pub(crate) use timed;
