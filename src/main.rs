fn main() {
    fleetkeeper_lib::run()
}
