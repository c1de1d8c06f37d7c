//! The agent's command registry.
//!
//! An explicit table maps wire command names (kebab-case) to handlers; any
//! name not in the table falls through to the default handler, which runs
//! the raw `cmd` string on the emulator's monitor. Handlers produce the
//! child-side response objects directly: `{"rsp": …}`, `{"out": [o, e]}` or
//! `{"err": …}`.

use serde_json::{json, Map, Value};
use tracing::debug;

use super::backend::Peripheral;
use super::sensors::{SensorKind, SENSOR_KINDS};
use super::AgentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Quit,
    Machines,
    Uarts,
    Buttons,
    Leds,
    ButtonSet,
    Sensors,
    SensorSet,
    SensorGet,
}

/// Wire name → handler. Unknown names run on the monitor.
fn lookup(name: &str) -> Option<Command> {
    match name {
        "quit" => Some(Command::Quit),
        "machines" => Some(Command::Machines),
        "uarts" => Some(Command::Uarts),
        "buttons" => Some(Command::Buttons),
        "leds" => Some(Command::Leds),
        "button-set" => Some(Command::ButtonSet),
        "sensors" => Some(Command::Sensors),
        "sensor-set" => Some(Command::SensorSet),
        "sensor-get" => Some(Command::SensorGet),
        _ => None,
    }
}

/// Dispatch one decoded request. Always returns a response object.
pub async fn run(state: &mut AgentState, command: &str, message: &Map<String, Value>) -> Value {
    match lookup(command) {
        Some(Command::Quit) => quit(state).await,
        Some(Command::Machines) => machines(state).await,
        Some(Command::Uarts) => list_peripherals(state, message, Peripheral::is_uart).await,
        Some(Command::Buttons) => list_peripherals(state, message, Peripheral::is_button).await,
        Some(Command::Leds) => list_peripherals(state, message, Peripheral::is_led).await,
        Some(Command::ButtonSet) => button_set(state, message).await,
        Some(Command::Sensors) => sensors(state, message).await,
        Some(Command::SensorSet) => sensor_set(state, message).await,
        Some(Command::SensorGet) => sensor_get(state, message).await,
        None => execute_default(state, command).await,
    }
}

fn missing(argument: &str) -> Value {
    json!({"err": format!("missing required argument '{argument}'")})
}

fn error(text: impl Into<String>) -> Value {
    json!({"err": text.into()})
}

fn required_str<'a>(message: &'a Map<String, Value>, key: &str) -> Result<&'a str, Value> {
    message
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(key))
}

/// Resolve the `machine` argument and make sure it names a live machine.
async fn required_machine(
    state: &mut AgentState,
    message: &Map<String, Value>,
) -> Result<String, Value> {
    let machine = required_str(message, "machine")?;
    let machines = state.backend.machines().await.map_err(error)?;
    if !machines.iter().any(|name| name == machine) {
        return Err(error("provided machine does not exist"));
    }
    Ok(machine.to_string())
}

async fn quit(state: &mut AgentState) -> Value {
    debug!("closing");
    state.quit().await;
    json!({"rsp": "closing"})
}

async fn machines(state: &mut AgentState) -> Value {
    match state.backend.machines().await {
        Ok(names) => json!({"rsp": names}),
        Err(e) => error(e),
    }
}

/// Default handler: run the raw command on the monitor and report both
/// output streams.
async fn execute_default(state: &mut AgentState, command: &str) -> Value {
    let (out, err) = state.execute(command).await;
    debug!("executing Monitor command `{command}`");
    json!({"out": [out, err]})
}

/// Shared body of `uarts`, `buttons` and `leds`: full paths of the
/// machine's peripherals matching a predicate.
async fn list_peripherals(
    state: &mut AgentState,
    message: &Map<String, Value>,
    predicate: fn(&Peripheral) -> bool,
) -> Value {
    let machine = match required_machine(state, message).await {
        Ok(machine) => machine,
        Err(e) => return e,
    };
    match state.backend.peripherals(&machine).await {
        Ok(peripherals) => {
            let names: Vec<String> = peripherals
                .iter()
                .filter(|peripheral| predicate(peripheral))
                .map(|peripheral| peripheral.path.clone())
                .collect();
            json!({"rsp": names})
        }
        Err(e) => error(e),
    }
}

async fn button_set(state: &mut AgentState, message: &Map<String, Value>) -> Value {
    let machine = match required_machine(state, message).await {
        Ok(machine) => machine,
        Err(e) => return e,
    };
    let peripheral = match required_str(message, "peripheral") {
        Ok(peripheral) => peripheral.to_string(),
        Err(e) => return e,
    };
    let Some(value) = message.get("value").and_then(Value::as_bool) else {
        return missing("value");
    };

    let pressed = match state
        .backend
        .get_property(&machine, &peripheral, "Pressed")
        .await
    {
        Ok(text) => text.trim().eq_ignore_ascii_case("true"),
        Err(_) => return error(format!("Button {peripheral} not found")),
    };

    if value && pressed {
        return error(format!(
            "trying to press button {peripheral} which is already pressed"
        ));
    }
    if !value && !pressed {
        return error(format!(
            "trying to release button {peripheral} which is not pressed"
        ));
    }

    let invocation = if value { "Press" } else { "Release" };
    match state.backend.invoke(&machine, &peripheral, invocation).await {
        Ok(()) => json!({"rsp": "ok"}),
        Err(_) => error(format!("Button {peripheral} not found")),
    }
}

/// List sensors with the kinds each one answers to, optionally filtered by
/// kind.
async fn sensors(state: &mut AgentState, message: &Map<String, Value>) -> Value {
    let machine = match required_machine(state, message).await {
        Ok(machine) => machine,
        Err(e) => return e,
    };
    let filter = match message.get("type").and_then(Value::as_str) {
        Some(name) => match SensorKind::from_wire(name) {
            Some(kind) => Some(kind),
            None => return error(format!("not supported 'type' value: '{name}'")),
        },
        None => None,
    };

    let peripherals = match state.backend.peripherals(&machine).await {
        Ok(peripherals) => peripherals,
        Err(e) => return error(e),
    };

    let mut instances = Vec::new();
    for peripheral in peripherals {
        let mut kinds = Vec::new();
        for kind in SENSOR_KINDS {
            if kind
                .probes(state.backend.as_mut(), &machine, &peripheral.path)
                .await
            {
                kinds.push(kind.wire_name());
            }
        }
        if kinds.is_empty() {
            continue;
        }
        if let Some(filter) = filter {
            if !kinds.contains(&filter.wire_name()) {
                continue;
            }
        }
        instances.push(json!({"name": peripheral.path, "types": kinds}));
    }
    json!({"rsp": instances})
}

async fn sensor_set(state: &mut AgentState, message: &Map<String, Value>) -> Value {
    let machine = match required_machine(state, message).await {
        Ok(machine) => machine,
        Err(e) => return e,
    };
    let peripheral = match required_str(message, "peripheral") {
        Ok(peripheral) => peripheral.to_string(),
        Err(e) => return e,
    };
    let kind = match required_sensor_kind(message) {
        Ok(kind) => kind,
        Err(e) => return e,
    };
    let Some(value) = message.get("value") else {
        return missing("value");
    };

    match kind
        .set(state.backend.as_mut(), &machine, &peripheral, value)
        .await
    {
        Ok(()) => json!({"rsp": "ok"}),
        Err(e) if e.starts_with("value") || e.starts_with("missing") => error(e),
        Err(_) => error(format!(
            "peripheral {peripheral} implementing '{}' not found",
            kind.wire_name()
        )),
    }
}

async fn sensor_get(state: &mut AgentState, message: &Map<String, Value>) -> Value {
    let machine = match required_machine(state, message).await {
        Ok(machine) => machine,
        Err(e) => return e,
    };
    let peripheral = match required_str(message, "peripheral") {
        Ok(peripheral) => peripheral.to_string(),
        Err(e) => return e,
    };
    let kind = match required_sensor_kind(message) {
        Ok(kind) => kind,
        Err(e) => return e,
    };

    match kind.get(state.backend.as_mut(), &machine, &peripheral).await {
        Ok(value) => json!({"rsp": value}),
        Err(_) => error(format!(
            "peripheral {peripheral} implementing '{}' not found",
            kind.wire_name()
        )),
    }
}

fn required_sensor_kind(message: &Map<String, Value>) -> Result<SensorKind, Value> {
    let name = required_str(message, "type")?;
    SensorKind::from_wire(name)
        .ok_or_else(|| error(format!("not supported 'type' value: '{name}'")))
}
