/// Lifecycle of an [`ApplicationProcess`](crate::ApplicationProcess).
///
/// ```text
/// Unstarted -> ContactingController -> AwaitingDatamanagerAssignment
///   -> ContactingDatamanager -> AwaitingShmKey -> Attached -> Running
///   -> Terminated
/// ```
///
/// Any fatal error moves straight to `Terminated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Unstarted,
    ContactingController,
    AwaitingDatamanagerAssignment,
    ContactingDatamanager,
    AwaitingShmKey,
    Attached,
    Running,
    Terminated,
}

impl ProcessState {
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ProcessState::ContactingController
                | ProcessState::AwaitingDatamanagerAssignment
                | ProcessState::ContactingDatamanager
                | ProcessState::AwaitingShmKey
                | ProcessState::Attached
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProcessState::Unstarted => "unstarted",
            ProcessState::ContactingController => "contacting controller",
            ProcessState::AwaitingDatamanagerAssignment => "awaiting datamanager assignment",
            ProcessState::ContactingDatamanager => "contacting datamanager",
            ProcessState::AwaitingShmKey => "awaiting shared memory key",
            ProcessState::Attached => "attached",
            ProcessState::Running => "running",
            ProcessState::Terminated => "terminated",
        })
    }
}
