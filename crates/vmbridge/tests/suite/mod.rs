// Controller scenarios share the in-process debuggee in `crate::harness`.
mod breakpoints;
mod disconnect;
mod jdwp_transport;
mod shell_runs;
mod startup;
