fn main() {
    bot_commons::start_everything("warn,antispam_devilbot=debug", antispam_devilbot::entry());
}
