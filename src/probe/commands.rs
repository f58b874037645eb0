use crate::exec::{Pipeline, ProcessSpec};

/// `ifconfig <iface> | grep inet | awk 'NR==1{print $2}'`
pub fn ip_address_pipeline(interface: &str) -> Pipeline {
    Pipeline::single(ProcessSpec::new("ifconfig").arg(interface))
        .pipe(ProcessSpec::new("grep").arg("inet"))
        .pipe(ProcessSpec::new("awk").arg("NR==1{print $2}"))
}

/// Longest command name the Linux kernel keeps for a process.
#[cfg(target_os = "linux")]
const COMM_LEN: usize = 15;

/// `ps -eo pid=,comm= | awk <exact match on name>`
///
/// Only the command name is listed, and it must equal `name` exactly, so
/// `shairport` never matches `shairport-sync` and the lookup cannot match
/// its own argument list.
pub fn process_lookup_pipeline(name: &str) -> Pipeline {
    Pipeline::single(ProcessSpec::new("ps").args(["-eo", "pid=,comm="]))
        .pipe(name_match_stage(command_name(name)))
}

/// Print the pid of the first `<pid> <name>` line whose name equals `name`.
/// The rest of the input is still read so the writer never sees SIGPIPE.
pub(crate) fn name_match_stage(name: &str) -> ProcessSpec {
    ProcessSpec::new("awk").args([
        "-v".to_string(),
        format!("name={name}"),
        r#"{ pid = $1; sub(/^[ \t]*[0-9]+[ \t]+/, ""); if (!found && $0 == name) { print pid; found = 1 } }"#
            .to_string(),
    ])
}

/// The name `ps` reports for a program called `name`. Linux truncates
/// command names to 15 bytes.
fn command_name(name: &str) -> &str {
    #[cfg(target_os = "linux")]
    if name.len() > COMM_LEN {
        let mut end = COMM_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        return &name[..end];
    }
    name
}

pub fn kill_pipeline(pid: u32) -> Pipeline {
    Pipeline::single(ProcessSpec::new("kill").arg(pid.to_string()))
}

pub fn which_pipeline(program: &str) -> Pipeline {
    Pipeline::single(ProcessSpec::new("which").arg(program))
}
